use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use serde::{Deserialize, Serialize};

/// Maps artifacts whose filename starts with `prefix` to one destination.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SiteBinding {
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    /// Remote install path handed to the consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wp_path: Option<String>,
    /// Target identity; falls back to `default_user_author`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wp_author: Option<String>,
    /// Credential scope: `<vps_secret_prefix>_VPS_HOST`, `_VPS_PORT`, ...
    pub vps_secret_prefix: String,
}

impl SiteBinding {
    pub fn new(prefix: impl Into<String>, vps_secret_prefix: impl Into<String>) -> Self {
        SiteBinding {
            prefix: prefix.into(),
            slug: None,
            wp_path: None,
            wp_author: None,
            vps_secret_prefix: vps_secret_prefix.into(),
        }
    }

    pub fn slug(&self) -> &str {
        self.slug.as_deref().filter(|s| !s.is_empty()).unwrap_or(&self.prefix)
    }

    pub fn remote_path(&self) -> Option<&str> {
        self.wp_path.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn author(&self) -> Option<&str> {
        self.wp_author.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// First binding, in configuration order, whose prefix starts `filename`.
/// Overlapping prefixes are not disambiguated further.
pub fn match_binding<'a>(sites: &'a [SiteBinding], filename: &str) -> Option<&'a SiteBinding> {
    sites.iter().find(|s| !s.prefix.is_empty() && filename.starts_with(&s.prefix))
}

pub fn show_table(sites: &[SiteBinding], default_author: Option<&str>) -> anyhow::Result<()> {
    if sites.is_empty() {
        println!("No sites configured.");
        return Ok(());
    }
    let title = vec![
        "Prefix".cell().bold(true),
        "Slug".cell().bold(true),
        "Author".cell().bold(true),
        "Remote Path".cell().bold(true),
        "Secret Prefix".cell().bold(true),
    ];
    let mut rows: Vec<Vec<CellStruct>> = Vec::new();
    for site in sites {
        let author = match (site.author(), default_author) {
            (Some(a), _) => a.to_string(),
            (None, Some(d)) => format!("{} (default)", d),
            (None, None) => "-".to_string(),
        };
        rows.push(vec![
            site.prefix.clone().cell(),
            site.slug().to_string().cell(),
            author.cell().justify(Justify::Right),
            site.remote_path().unwrap_or("-").to_string().cell().justify(Justify::Right),
            site.vps_secret_prefix.clone().cell().justify(Justify::Right),
        ]);
    }
    print_stdout(rows.table().title(title))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> Vec<SiteBinding> {
        vec![
            SiteBinding::new("site1", "S1"),
            SiteBinding::new("site1.alice", "S1A"),
            SiteBinding::new("shop", "SHOP"),
        ]
    }

    #[test]
    fn first_configured_match_wins() {
        let s = sites();
        let b = match_binding(&s, "site1.alice.zip").unwrap();
        assert_eq!(b.vps_secret_prefix, "S1");
    }

    #[test]
    fn unmatched_filename_has_no_binding() {
        assert!(match_binding(&sites(), "other.zip").is_none());
        assert!(match_binding(&sites(), "sit.zip").is_none());
    }

    #[test]
    fn slug_defaults_to_prefix() {
        let mut b = SiteBinding::new("shop", "SHOP");
        assert_eq!(b.slug(), "shop");
        b.slug = Some("shop-eu".into());
        assert_eq!(b.slug(), "shop-eu");
    }

    #[test]
    fn blank_fields_are_unresolved() {
        let mut b = SiteBinding::new("shop", "SHOP");
        b.wp_path = Some("  ".into());
        b.wp_author = Some(String::new());
        assert!(b.remote_path().is_none());
        assert!(b.author().is_none());
    }
}
