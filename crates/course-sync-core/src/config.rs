use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::TextCodec;
use crate::SyncError;

/// Host-supplied settings for one course name sync pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// External table holding the authoritative course names.
    pub table: String,
    pub fields: FieldMapping,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FieldMapping {
    pub full_name: String,
    pub short_name: String,
    pub id_number: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Location of the external database (file path or `file:` URI).
    pub path: String,
    /// Character encoding of the external data; unset means UTF-8.
    pub encoding: Option<String>,
    /// Statement executed once right after connecting.
    pub setup_sql: Option<String>,
    /// Log every statement issued against the external source.
    pub debug: bool,
}

/// A configured column name plus the lower-cased key used to read it back.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldName {
    pub name: String,
    pub key: String,
}

impl FieldName {
    fn resolve(raw: &str) -> Option<Self> {
        let name = raw.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self { name: name.to_string(), key: name.to_lowercase() })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedFields {
    pub full_name: FieldName,
    pub short_name: FieldName,
    pub id_number: Option<FieldName>,
}

impl ResolvedFields {
    /// Column names in select-list order.
    #[must_use]
    pub fn select_list(&self) -> Vec<&str> {
        let mut names = vec![self.full_name.name.as_str(), self.short_name.name.as_str()];
        if let Some(id_number) = &self.id_number {
            names.push(id_number.name.as_str());
        }
        names
    }
}

/// Configuration that passed validation; the only form a pass accepts.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub table: String,
    pub fields: ResolvedFields,
    pub source: SourceConfig,
    pub codec: TextCodec,
}

impl SyncConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidConfig`] when the document is malformed.
    pub fn from_toml_str(raw: &str) -> Result<Self, SyncError> {
        toml::from_str(raw).map_err(|err| SyncError::InvalidConfig(err.to_string()))
    }

    /// Read and parse a TOML config file.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidConfig`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            SyncError::InvalidConfig(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check that a pass can run with this configuration.
    ///
    /// # Errors
    /// Returns [`SyncError::NotConfigured`] when the source path, table, or a
    /// required field name is blank, and [`SyncError::InvalidConfig`] when the
    /// encoding label cannot be resolved.
    pub fn validate(&self) -> Result<ValidatedConfig, SyncError> {
        let path = self.source.path.trim();
        if path.is_empty() {
            return Err(SyncError::NotConfigured("source.path".to_string()));
        }
        let table = self.table.trim();
        if table.is_empty() {
            return Err(SyncError::NotConfigured("table".to_string()));
        }
        let full_name = FieldName::resolve(&self.fields.full_name)
            .ok_or_else(|| SyncError::NotConfigured("fields.full_name".to_string()))?;
        let short_name = FieldName::resolve(&self.fields.short_name)
            .ok_or_else(|| SyncError::NotConfigured("fields.short_name".to_string()))?;
        let id_number = self.fields.id_number.as_deref().and_then(FieldName::resolve);

        let codec = TextCodec::for_label(self.source.encoding.as_deref())?;
        let setup_sql = self
            .source
            .setup_sql
            .as_deref()
            .map(str::trim)
            .filter(|sql| !sql.is_empty())
            .map(str::to_string);

        Ok(ValidatedConfig {
            table: table.to_string(),
            fields: ResolvedFields { full_name, short_name, id_number },
            source: SourceConfig {
                path: path.to_string(),
                encoding: self.source.encoding.clone(),
                setup_sql,
                debug: self.source.debug,
            },
            codec,
        })
    }
}
