use crate::{Error, Result};

/// How a row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// `INSERT .. ON CONFLICT (key) DO UPDATE`, replaying a row leaves the table unchanged.
    #[default]
    Upsert,
    /// Plain `INSERT`, a replayed row fails with a unique violation.
    Insert,
}

/// The table a sink writes to. Identifiers are validated when the statement is built, values are
/// always bound as parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Table name, optionally schema qualified (`schema.table`).
    pub table: String,
    /// Column with a unique constraint holding the record identifier.
    pub key_column: String,
    pub value_columns: Vec<String>,
    pub mode: WriteMode,
}

impl TableSpec {
    /// Builds the statement executed for every row. `$1` is the key, the value columns follow in
    /// order.
    pub fn statement(&self) -> Result<String> {
        let table = quote_qualified(&self.table)?;
        let key = quote_ident(&self.key_column)?;
        let values = self
            .value_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        if values.contains(&key) {
            return Err(Error::Config(format!(
                "key column {key} is also listed as a value column"
            )));
        }

        let columns = std::iter::once(key.as_str())
            .chain(values.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=values.len() + 1)
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})");

        Ok(match self.mode {
            WriteMode::Insert => insert,
            WriteMode::Upsert if values.is_empty() => {
                format!("{insert} ON CONFLICT ({key}) DO NOTHING")
            }
            WriteMode::Upsert => {
                let updates = values
                    .iter()
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{insert} ON CONFLICT ({key}) DO UPDATE SET {updates}")
            }
        })
    }
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_]*` of at most 63 bytes (NAMEDATALEN - 1).
pub fn is_valid_ident(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    ident.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_ident(ident: &str) -> Result<String> {
    if !is_valid_ident(ident) {
        return Err(Error::Config(format!("invalid SQL identifier {ident:?}")));
    }
    Ok(format!("\"{ident}\""))
}

/// Quotes `table` or `schema.table`.
pub fn quote_qualified(name: &str) -> Result<String> {
    match name.split_once('.') {
        Some((schema, table)) => Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?)),
        None => quote_ident(name),
    }
}
