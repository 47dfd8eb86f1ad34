use crate::CoreError;
use templar_schema::validate_template_name;

/// Inclusion/exclusion filter over template names.
///
/// An empty `only` means "everything". `except` is applied after `only`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub only: Vec<String>,
    pub except: Vec<String>,
}

impl Selection {
    pub fn new(only: Vec<String>, except: Vec<String>) -> Self {
        Self { only, except }
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// Filter `available` (kept in its order). Every name in either list
    /// must be known, otherwise nothing is selected and a configuration
    /// error is returned.
    pub fn apply(&self, available: &[String]) -> Result<Vec<String>, CoreError> {
        for (list, label) in [(&self.only, "inclusion"), (&self.except, "exclusion")] {
            for name in list {
                validate_template_name(name).map_err(|e| {
                    CoreError::Config(format!("{label} list: {e}"))
                })?;
                if !available.iter().any(|a| a == name) {
                    return Err(CoreError::Config(format!(
                        "unknown template '{name}' in {label} list"
                    )));
                }
            }
        }

        Ok(available
            .iter()
            .filter(|n| self.only.is_empty() || self.only.contains(n))
            .filter(|n| !self.except.contains(n))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        ["alma-9", "debian-12", "ubuntu-24.04"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn sel(only: &[&str], except: &[&str]) -> Selection {
        Selection::new(
            only.iter().map(|s| (*s).to_owned()).collect(),
            except.iter().map(|s| (*s).to_owned()).collect(),
        )
    }

    #[test]
    fn empty_selects_everything() {
        assert_eq!(Selection::all().apply(&names()).unwrap(), names());
    }

    #[test]
    fn only_and_except_combine() {
        let got = sel(&["debian-12", "alma-9"], &["alma-9"]).apply(&names()).unwrap();
        assert_eq!(got, vec!["debian-12"]);
        let got = sel(&[], &["debian-12"]).apply(&names()).unwrap();
        assert_eq!(got, vec!["alma-9", "ubuntu-24.04"]);
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let err = sel(&["fedora-40"], &[]).apply(&names()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("fedora-40"));
        assert!(sel(&[], &["nope"]).apply(&names()).is_err());
        assert!(sel(&["bad name!"], &[]).apply(&names()).is_err());
    }
}
