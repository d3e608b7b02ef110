//! Locator normalization.
//!
//! Different URL forms often point at the same document (an arXiv abstract
//! page and its PDF, for instance). Reference entries are rewritten through a
//! rule set before storage so they collapse to one canonical form.

use serde::Deserialize;
use url::Url;

/// A single rewrite rule.
///
/// Applies to URLs whose host equals `host` (a leading `www.` on either side
/// is ignored) and whose path starts with `from_prefix`. The prefix becomes
/// `to_prefix`, trailing slashes are dropped, and `suffix` is appended unless
/// the path already ends with it. The host is rewritten to `host`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LocatorRule {
  pub host: String,
  pub from_prefix: String,
  pub to_prefix: String,
  #[serde(default)]
  pub suffix: Option<String>,
}

impl LocatorRule {
  /// arXiv abstract page -> PDF.
  pub fn arxiv_abs_to_pdf() -> Self {
    Self {
      host: "arxiv.org".to_string(),
      from_prefix: "/abs/".to_string(),
      to_prefix: "/pdf/".to_string(),
      suffix: Some(".pdf".to_string()),
    }
  }

  fn matches_host(&self, host: &str) -> bool {
    strip_www(host).eq_ignore_ascii_case(strip_www(&self.host))
  }

  /// Rewrite `url` in place. Returns true if the rule applied.
  fn apply(&self, url: &mut Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    if !self.matches_host(host) {
      return false;
    }

    let Some(rest) = url.path().strip_prefix(&self.from_prefix) else {
      return false;
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
      return false;
    }

    let mut path = format!("{}{}", self.to_prefix, rest);
    if let Some(suffix) = &self.suffix {
      if !path.ends_with(suffix.as_str()) {
        path.push_str(suffix);
      }
    }
    if url.set_host(Some(&self.host)).is_err() {
      return false;
    }
    url.set_path(&path);
    true
  }
}

fn strip_www(host: &str) -> &str {
  host.strip_prefix("www.").unwrap_or(host)
}

/// Ordered rule set; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct LocatorNormalizer {
  rules: Vec<LocatorRule>,
}

impl LocatorNormalizer {
  pub fn new(rules: Vec<LocatorRule>) -> Self {
    Self { rules }
  }

  /// No rewriting at all.
  pub fn identity() -> Self {
    Self::new(Vec::new())
  }

  pub fn rules(&self) -> &[LocatorRule] {
    &self.rules
  }

  /// Canonical form of `locator`. Anything that does not parse as a URL is
  /// returned unchanged.
  pub fn normalize(&self, locator: &str) -> String {
    let trimmed = locator.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
      return trimmed.to_string();
    };

    for rule in &self.rules {
      if rule.apply(&mut url) {
        tracing::debug!("Normalized locator {} -> {}", trimmed, url);
        return url.into();
      }
    }

    trimmed.to_string()
  }
}

impl Default for LocatorNormalizer {
  fn default() -> Self {
    Self::new(vec![LocatorRule::arxiv_abs_to_pdf()])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_arxiv_abs_rewritten_to_pdf() {
    let normalizer = LocatorNormalizer::default();
    assert_eq!(
      normalizer.normalize("https://arxiv.org/abs/1234.5678"),
      "https://arxiv.org/pdf/1234.5678.pdf"
    );
  }

  #[test]
  fn test_arxiv_www_host_and_versioned_id() {
    let normalizer = LocatorNormalizer::default();
    assert_eq!(
      normalizer.normalize("https://www.arxiv.org/abs/2101.00001v2"),
      "https://arxiv.org/pdf/2101.00001v2.pdf"
    );
  }

  #[test]
  fn test_canonical_form_is_stable() {
    let normalizer = LocatorNormalizer::default();
    let once = normalizer.normalize("https://arxiv.org/abs/1234.5678");
    assert_eq!(normalizer.normalize(&once), once);
    assert_eq!(
      normalizer.normalize("https://arxiv.org/pdf/1234.5678.pdf"),
      "https://arxiv.org/pdf/1234.5678.pdf"
    );
  }

  #[test]
  fn test_other_hosts_untouched() {
    let normalizer = LocatorNormalizer::default();
    let url = "https://example.com/abs/1234.5678";
    assert_eq!(normalizer.normalize(url), url);
  }

  #[test]
  fn test_unparseable_locator_kept_verbatim() {
    let normalizer = LocatorNormalizer::default();
    assert_eq!(normalizer.normalize("  papers/local.pdf "), "papers/local.pdf");
  }

  #[test]
  fn test_bare_prefix_not_rewritten() {
    let normalizer = LocatorNormalizer::default();
    assert_eq!(
      normalizer.normalize("https://arxiv.org/abs/"),
      "https://arxiv.org/abs/"
    );
  }

  #[test]
  fn test_custom_rule_without_suffix() {
    let normalizer = LocatorNormalizer::new(vec![LocatorRule {
      host: "openreview.net".to_string(),
      from_prefix: "/forum/".to_string(),
      to_prefix: "/pdf/".to_string(),
      suffix: None,
    }]);
    assert_eq!(
      normalizer.normalize("https://openreview.net/forum/abc123?ref=feed"),
      "https://openreview.net/pdf/abc123?ref=feed"
    );
  }

  #[test]
  fn test_trailing_slash_collapses_to_same_pdf() {
    let normalizer = LocatorNormalizer::default();
    assert_eq!(
      normalizer.normalize("https://arxiv.org/abs/1234.5678/"),
      "https://arxiv.org/pdf/1234.5678.pdf"
    );
    assert_eq!(
      normalizer.normalize("https://arxiv.org/abs//"),
      "https://arxiv.org/abs//"
    );
  }

  #[test]
  fn test_www_host_collapses_to_rule_host() {
    let normalizer = LocatorNormalizer::default();
    let canonical = normalizer.normalize("https://arxiv.org/abs/1234.5678");
    assert_eq!(normalizer.normalize("https://www.arxiv.org/abs/1234.5678"), canonical);
    assert_eq!(normalizer.normalize("https://WWW.ArXiv.org/abs/1234.5678/"), canonical);
  }

  #[test]
  fn test_identity_normalizer() {
    let normalizer = LocatorNormalizer::identity();
    let url = "https://arxiv.org/abs/1234.5678";
    assert_eq!(normalizer.normalize(url), url);
  }

  #[test]
  fn test_rule_deserializes_from_yaml() {
    let yaml = "host: arxiv.org\nfrom_prefix: /abs/\nto_prefix: /pdf/\nsuffix: .pdf\n";
    let rule: LocatorRule = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(rule, LocatorRule::arxiv_abs_to_pdf());
  }
}
