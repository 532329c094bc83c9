use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable snapshot of the target database's structure.
///
/// Tables are keyed by lowercased name so lookups are case-insensitive.
/// A refresh builds a new snapshot; nothing mutates one after it is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub schema_name: String,
    pub tables: BTreeMap<String, TableSchema>,
    pub foreign_keys: Vec<ForeignKey>,
    pub version: u64,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub row_count: Option<i64>,
    pub description: Option<String>,
    #[serde(default)]
    pub sample_rows: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub semantic_type: SemanticType,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Integer,
    Decimal,
    Text,
    Boolean,
    Temporal,
    Json,
    Other,
}

impl SemanticType {
    /// Derive the semantic type from an information_schema data type
    pub fn from_sql_type(data_type: &str) -> Self {
        let lowered = data_type.to_lowercase();
        match lowered.as_str() {
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "serial" | "bigserial" => {
                SemanticType::Integer
            }
            "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" | "money" => {
                SemanticType::Decimal
            }
            "boolean" | "bool" => SemanticType::Boolean,
            "json" | "jsonb" => SemanticType::Json,
            t if t.starts_with("timestamp")
                || t.starts_with("date")
                || t.starts_with("time")
                || t.starts_with("interval") =>
            {
                SemanticType::Temporal
            }
            t if t.contains("char") || t == "text" || t == "uuid" || t == "name" => SemanticType::Text,
            _ => SemanticType::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKey {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub constraint_name: Option<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            row_count: None,
            description: None,
            sample_rows: Vec::new(),
        }
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_nullable: bool) -> Self {
        let data_type = data_type.into();
        Self {
            name: name.into(),
            semantic_type: SemanticType::from_sql_type(&data_type),
            data_type,
            is_nullable,
            is_primary_key: false,
            description: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }
}

impl SchemaCatalog {
    pub fn new(schema_name: impl Into<String>, tables: Vec<TableSchema>, foreign_keys: Vec<ForeignKey>) -> Self {
        Self {
            schema_name: schema_name.into(),
            tables: tables
                .into_iter()
                .map(|table| (table.name.to_lowercase(), table))
                .collect(),
            foreign_keys,
            version: 0,
            retrieved_at: Utc::now(),
        }
    }

    /// Case-insensitive table lookup
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Known table names whose lowercased form contains, or is contained in,
    /// the given fragment. Used to explain why an identifier did not resolve.
    pub fn partial_table_matches(&self, fragment: &str) -> Vec<&str> {
        let fragment = fragment.to_lowercase();
        self.tables
            .iter()
            .filter(|(key, _)| key.contains(&fragment) || fragment.contains(key.as_str()))
            .map(|(_, table)| table.name.as_str())
            .collect()
    }

    /// Same as `partial_table_matches` but for columns of one table
    pub fn partial_column_matches<'a>(&'a self, table: &'a TableSchema, fragment: &str) -> Vec<&'a str> {
        let fragment = fragment.to_lowercase();
        table
            .columns
            .iter()
            .filter(|column| {
                let name = column.name.to_lowercase();
                name.contains(&fragment) || fragment.contains(&name)
            })
            .map(|column| column.name.as_str())
            .collect()
    }

    /// Compact one-line-per-table summary for intent classification
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        for table in self.tables.values() {
            let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
            summary.push_str(&format!("{}({})\n", table.name, columns.join(", ")));
        }
        summary
    }

    /// Full grounding context for query synthesis
    pub fn prompt_context(&self) -> String {
        let mut context = format!("Schema: {}\n\n", self.schema_name);

        for table in self.tables.values() {
            context.push_str(&format!("Table: {}\n", table.name));
            if let Some(description) = &table.description {
                context.push_str(&format!("Description: {}\n", description));
            }
            context.push_str("Columns:\n");
            for column in &table.columns {
                context.push_str(&format!("  - {} ({})", column.name, column.data_type));
                if column.is_primary_key {
                    context.push_str(" [PRIMARY KEY]");
                }
                if !column.is_nullable {
                    context.push_str(" [NOT NULL]");
                }
                if let Some(description) = &column.description {
                    context.push_str(&format!(" - {}", description));
                }
                context.push('\n');
            }
            if !table.sample_rows.is_empty() {
                context.push_str(&format!("Sample data ({} rows):\n", table.sample_rows.len()));
                for row in &table.sample_rows {
                    context.push_str(&format!("  {}\n", row));
                }
            }
            if let Some(row_count) = table.row_count.filter(|count| *count > 0) {
                context.push_str(&format!("Total rows: {}\n", row_count));
            }
            context.push('\n');
        }

        if !self.foreign_keys.is_empty() {
            context.push_str("Relationships:\n");
            for fk in &self.foreign_keys {
                context.push_str(&format!(
                    "  {}.{} -> {}.{}\n",
                    fk.source_table, fk.source_column, fk.target_table, fk.target_column
                ));
            }
        }

        context
    }
}
