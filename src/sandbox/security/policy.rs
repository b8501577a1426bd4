use super::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A source expression inside a directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceExpr {
    None,
    UnsafeInline,
    UnsafeEval,
    Data,
    Blob,
    /// An exact URL or URL prefix ending in `/`.
    Url(String),
}

/// A runtime bundle the isolated context may load. Its source is supplied by
/// the host so the guest never performs the fetch itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeBundle {
    pub url: String,
    #[serde(default)]
    pub source: String,
}

/// Content policy applied to the isolated context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPolicy {
    pub directives: BTreeMap<String, Vec<SourceExpr>>,
    #[serde(default)]
    pub runtime_bundles: Vec<RuntimeBundle>,
}

/// Directives that must resolve to `'none'` for the policy to count as isolating.
const LOCKED_DIRECTIVES: [&str; 4] = ["connect-src", "frame-src", "form-action", "default-src"];

impl ContentPolicy {
    pub fn locked_down() -> Self {
        let mut directives = BTreeMap::new();
        directives.insert("default-src".to_string(), vec![SourceExpr::None]);
        directives.insert(
            "script-src".to_string(),
            vec![SourceExpr::UnsafeInline, SourceExpr::UnsafeEval],
        );
        directives.insert("style-src".to_string(), vec![SourceExpr::UnsafeInline]);
        directives.insert(
            "img-src".to_string(),
            vec![SourceExpr::Data, SourceExpr::Blob],
        );
        directives.insert("font-src".to_string(), vec![SourceExpr::Data]);
        directives.insert("connect-src".to_string(), vec![SourceExpr::None]);
        directives.insert("frame-src".to_string(), vec![SourceExpr::None]);
        directives.insert("form-action".to_string(), vec![SourceExpr::None]);

        Self {
            directives,
            runtime_bundles: Vec::new(),
        }
    }

    pub fn with_bundle(mut self, url: impl Into<String>, source: impl Into<String>) -> Self {
        let url = url.into();
        self.directives
            .entry("script-src".to_string())
            .or_default()
            .push(SourceExpr::Url(url.clone()));
        self.runtime_bundles.push(RuntimeBundle {
            url,
            source: source.into(),
        });
        self
    }

    /// Rejects policies that would let the guest reach the network or other frames.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for name in LOCKED_DIRECTIVES {
            match self.directives.get(name) {
                Some(sources) if sources.as_slice() == [SourceExpr::None] => {}
                Some(_) => {
                    return Err(PolicyError::Unsupported(format!(
                        "directive {name} must be 'none'"
                    )))
                }
                None if name == "default-src" => {
                    return Err(PolicyError::Unsupported(
                        "default-src 'none' is required".to_string(),
                    ))
                }
                None => {}
            }
        }

        for (name, sources) in &self.directives {
            if sources.is_empty() {
                return Err(PolicyError::Invalid(format!("directive {name} has no sources")));
            }
            if sources.len() > 1 && sources.contains(&SourceExpr::None) {
                return Err(PolicyError::Invalid(format!(
                    "directive {name} mixes 'none' with other sources"
                )));
            }
            for source in sources {
                if let SourceExpr::Url(url) = source {
                    if name != "script-src" {
                        return Err(PolicyError::Unsupported(format!(
                            "remote source {url} only allowed in script-src"
                        )));
                    }
                    if !self.runtime_bundles.iter().any(|b| &b.url == url) {
                        return Err(PolicyError::Invalid(format!(
                            "script source {url} has no registered runtime bundle"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns the bundle source when `url` is an approved runtime bundle.
    pub fn bundle(&self, url: &str) -> Option<&RuntimeBundle> {
        self.runtime_bundles.iter().find(|bundle| bundle.url == url)
    }
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self::locked_down()
    }
}
