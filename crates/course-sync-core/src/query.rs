use crate::codec::TextCodec;
use crate::SyncError;

/// A read statement plus its positional parameters, already in the external encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub sql: String,
    pub params: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectBuilder<'a> {
    table: &'a str,
    fields: Vec<&'a str>,
    conditions: Vec<(&'a str, &'a str)>,
    distinct: bool,
    sort: Vec<&'a str>,
}

impl<'a> SelectBuilder<'a> {
    #[must_use]
    pub fn new(table: &'a str) -> Self {
        Self { table, ..Self::default() }
    }

    #[must_use]
    pub fn fields(mut self, fields: &[&'a str]) -> Self {
        self.fields.extend_from_slice(fields);
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    #[must_use]
    pub fn filter_eq(mut self, field: &'a str, value: &'a str) -> Self {
        self.conditions.push((field, value));
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: &'a str) -> Self {
        self.sort.push(field);
        self
    }

    /// Render the statement. Literal values are encoded for the external
    /// source and bound as parameters, never spliced into the SQL text.
    ///
    /// # Errors
    /// Returns [`SyncError::Encoding`] when a literal cannot be encoded.
    pub fn build(&self, codec: &TextCodec) -> Result<SelectQuery, SyncError> {
        let columns = if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields.iter().map(|field| quote_identifier(field)).collect::<Vec<_>>().join(", ")
        };

        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&columns);
        sql.push_str(" FROM ");
        sql.push_str(&quote_identifier(self.table));

        let mut params = Vec::with_capacity(self.conditions.len());
        for (index, (field, value)) in self.conditions.iter().enumerate() {
            sql.push_str(if index == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("{} = CAST(?{} AS TEXT)", quote_identifier(field), index + 1));
            params.push(codec.encode(value)?.into_owned());
        }

        if !self.sort.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(
                &self.sort.iter().map(|field| quote_identifier(field)).collect::<Vec<_>>().join(", "),
            );
        }

        Ok(SelectQuery { sql, params })
    }
}

/// Quote a possibly schema-qualified identifier (`schema.table`).
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    name.trim()
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}
