use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driver {
    /// Process-local database, lost when the last handle is dropped.
    Memory,
    /// Embedded sled database rooted at `url`.
    Sled,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Memory => "memory",
            Driver::Sled => "sled",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Driver::Memory),
            "sled" => Ok(Driver::Sled),
            other => Err(format!("Unknown driver: {other}")),
        }
    }
}

/// Everything needed to open a database: driver, location and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfiguration {
    pub driver: Driver,
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataSourceConfiguration {
    pub fn new(driver: Driver, url: impl Into<String>) -> Self {
        DataSourceConfiguration {
            driver,
            url: url.into(),
            user: None,
            password: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self::new(Driver::Memory, name)
    }

    pub fn sled(path: impl Into<String>) -> Self {
        Self::new(Driver::Sled, path)
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Identity safe for logs and events: never includes the password.
    pub fn describe(&self) -> String {
        match &self.user {
            Some(user) => format!("{}://{}@{}", self.driver, user, self.url),
            None => format!("{}://{}", self.driver, self.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_redacts_password() {
        let cfg = DataSourceConfiguration::sled("/var/db").with_credentials("app", "hunter2");
        let described = cfg.describe();
        assert_eq!(described, "sled://app@/var/db");
        assert!(!described.contains("hunter2"));
    }

    #[test]
    fn parses_driver_names() {
        assert_eq!("SLED".parse::<Driver>(), Ok(Driver::Sled));
        assert_eq!("mem".parse::<Driver>(), Ok(Driver::Memory));
        assert!("oracle".parse::<Driver>().is_err());
    }
}
