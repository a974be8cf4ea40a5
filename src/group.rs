use std::collections::HashMap;
use std::fmt;

use crate::QueueError;
use crate::config::EnvSource;
use crate::job::Job;

/// Where a host group's session connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    /// Credential scope the host and port were resolved from.
    pub scope: String,
}

impl Destination {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} [{}]", self.host, self.port, self.scope)
    }
}

#[derive(Debug, Clone)]
pub struct HostGroup {
    pub destination: Destination,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub groups: Vec<HostGroup>,
    /// Jobs dropped because their scope did not resolve to a destination.
    pub failures: Vec<(Job, QueueError)>,
}

/// Look up `<SCOPE>_VPS_HOST` and `<SCOPE>_VPS_PORT`.
pub fn resolve_destination(scope: &str, env: &dyn EnvSource) -> Result<Destination, QueueError> {
    let host = env
        .var(&format!("{}_VPS_HOST", scope))
        .map(|h| h.trim().to_string())
        .ok_or_else(|| QueueError::HostUnresolved(scope.to_string()))?;
    let raw_port = env.var(&format!("{}_VPS_PORT", scope)).unwrap_or_default();
    let port = match raw_port.trim().parse::<u16>() {
        Ok(p) if p > 0 => p,
        _ => return Err(QueueError::PortInvalid(scope.to_string(), raw_port)),
    };
    Ok(Destination { host, port, scope: scope.to_string() })
}

/// Partition jobs by destination. Each scope is resolved once; groups and
/// the jobs inside them keep first-seen order.
pub fn group_jobs(jobs: Vec<Job>, env: &dyn EnvSource) -> GroupOutcome {
    let mut resolved: HashMap<String, Result<Destination, QueueError>> = HashMap::new();
    let mut index: HashMap<Destination, usize> = HashMap::new();
    let mut outcome = GroupOutcome::default();

    for job in jobs {
        let dest = resolved
            .entry(job.scope.clone())
            .or_insert_with(|| {
                let r = resolve_destination(&job.scope, env);
                if let Err(e) = &r {
                    tracing::warn!("[group] scope {}: {}", job.scope, e);
                }
                r
            })
            .clone();
        match dest {
            Ok(dest) => match index.get(&dest) {
                Some(&i) => outcome.groups[i].jobs.push(job),
                None => {
                    index.insert(dest.clone(), outcome.groups.len());
                    outcome.groups.push(HostGroup { destination: dest, jobs: vec![job] });
                }
            },
            Err(e) => outcome.failures.push((job, e)),
        }
    }

    for g in &outcome.groups {
        tracing::debug!("[group] {} -> {} job(s)", g.destination, g.jobs.len());
    }
    outcome
}
