use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};
use crate::service::ServiceId;

/// One service a module declares, with an optional human alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDecl {
    pub id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ServiceDecl {
    pub fn new(id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        self.alias = if alias.is_empty() { None } else { Some(alias) };
        self
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref().filter(|a| !a.is_empty())
    }
}

/// Static description of a loadable module.
///
/// ```toml
/// name = "echo"
/// mainBinary = "libecho.so"
///
/// [[serviceIds]]
/// id = "echo.Echo"
/// alias = "echoSvc"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub main_binary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_ids: Vec<ServiceDecl>,
}

impl Manifest {
    pub fn new(name: impl Into<String>, main_binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            main_binary: main_binary.into(),
            service_ids: Vec::new(),
        }
    }

    pub fn with_service(mut self, decl: ServiceDecl) -> Self {
        self.service_ids.push(decl);
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Reading module manifest");

        let content = std::fs::read_to_string(path).map_err(|e| HostError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::parse(&content).map_err(|reason| HostError::Manifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Self::parse(content).map_err(|reason| HostError::Manifest {
            path: Default::default(),
            reason,
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        self.validate().map_err(|reason| HostError::Manifest {
            path: Default::default(),
            reason,
        })?;
        Ok(toml::to_string_pretty(self)?)
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        let manifest: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("empty name".to_string());
        }
        if self.main_binary.is_empty() {
            return Err("empty mainBinary".to_string());
        }
        if let Some(bad) = self.service_ids.iter().find(|s| s.id.is_empty()) {
            return Err(format!("malformed service id for alias {:?}", bad.alias));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
name = "echo"
mainBinary = "libecho.so"

[[serviceIds]]
id = "X"
alias = "echoSvc"

[[serviceIds]]
id = "modhost.Daemon"
"#;

    #[test]
    fn parses_ordered_service_ids() {
        let m = Manifest::from_toml(ECHO).unwrap();
        assert_eq!(m.name, "echo");
        assert_eq!(m.main_binary, "libecho.so");
        assert_eq!(m.service_ids.len(), 2);
        assert_eq!(m.service_ids[0].id.as_str(), "X");
        assert_eq!(m.service_ids[0].alias(), Some("echoSvc"));
        assert_eq!(m.service_ids[1].alias(), None);
    }

    #[test]
    fn rejects_partial_manifest() {
        assert!(Manifest::from_toml("name = \"echo\"").is_err());
        assert!(Manifest::from_toml("name = \"\"\nmainBinary = \"a.so\"").is_err());
        assert!(Manifest::from_toml("name = \"a\"\nmainBinary = \"a.so\"\n[[serviceIds]]\nid = \"\"").is_err());
    }

    #[test]
    fn serializes_back_to_same_manifest() {
        let m = Manifest::new("echo", "libecho.so")
            .with_service(ServiceDecl::new("X").with_alias("echoSvc"))
            .with_service(ServiceDecl::new("Y").with_alias(""));
        let text = m.to_toml().unwrap();
        assert!(text.contains("mainBinary"));
        assert_eq!(Manifest::from_toml(&text).unwrap(), m);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Manifest::from_file(Path::new("/nonexistent/echo.manifest")).unwrap_err();
        assert!(err.to_string().contains("echo.manifest"));
    }
}
