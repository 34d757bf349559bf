use std::{collections::BTreeMap, sync::OnceLock};

use regex::{Captures, Regex};

/// Named values substituted into `${NAME}` tokens of node descriptor fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables initialized from the process environment
    pub fn from_env() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replace every known `${NAME}` token. Unknown tokens are kept verbatim.
    pub fn substitute(&self, raw: &str) -> String {
        static VARIABLE_REGEX: OnceLock<Regex> = OnceLock::new();

        VARIABLE_REGEX
            .get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("invalid regex"))
            .replace_all(raw, |captures: &Captures| match self.get(&captures[1]) {
                Some(value) => value.to_string(),
                None => captures[0].to_string(),
            })
            .into_owned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("${HOST}", "node-1")]
    #[case("http://${HOST}:${PORT}/", "http://node-1:8080/")]
    #[case("${MISSING}", "${MISSING}")]
    #[case("plain", "plain")]
    #[case("$HOST", "$HOST")]
    fn substitute(#[case] raw: &str, #[case] expected: &str) {
        let variables: Variables = [("HOST", "node-1"), ("PORT", "8080")].into_iter().collect();

        assert_eq!(variables.substitute(raw), expected);
    }
}
