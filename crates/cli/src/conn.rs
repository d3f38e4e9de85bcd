use model::datasource::{DataSourceConfiguration, Driver};
use std::str::FromStr;

/// A data source given on the command line as `driver://location`.
///
/// A bare path is taken to be a sled database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceArg(pub DataSourceConfiguration);

impl FromStr for DataSourceArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty data source".to_string());
        }

        let (driver, location) = match s.split_once("://") {
            Some((scheme, rest)) => (Driver::from_str(scheme)?, rest),
            None => (Driver::Sled, s),
        };
        if location.is_empty() {
            return Err(format!("Missing location in data source '{s}'"));
        }

        Ok(DataSourceArg(DataSourceConfiguration::new(driver, location)))
    }
}

impl DataSourceArg {
    pub fn into_config(self) -> DataSourceConfiguration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_and_location() {
        let arg: DataSourceArg = "sled:///var/lib/app".parse().unwrap();
        assert_eq!(arg.0, DataSourceConfiguration::sled("/var/lib/app"));

        let arg: DataSourceArg = "memory://scratch".parse().unwrap();
        assert_eq!(arg.0, DataSourceConfiguration::memory("scratch"));
    }

    #[test]
    fn bare_path_is_sled() {
        let arg: DataSourceArg = "./data/db".parse().unwrap();
        assert_eq!(arg.0.driver, Driver::Sled);
        assert_eq!(arg.0.url, "./data/db");
    }

    #[test]
    fn rejects_unknown_driver_and_empty_location() {
        assert!("oracle://db".parse::<DataSourceArg>().is_err());
        assert!("sled://".parse::<DataSourceArg>().is_err());
        assert!("".parse::<DataSourceArg>().is_err());
    }
}
