//! Creating an empty table.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tidal_core::observability::table_span;
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::commit::{CommitPlanner, Committer, Operation, Planned, PreparedCommit};
use crate::error::{Result, TableError};
use crate::log::{Action, Metadata};
use crate::operations::write::SaveMode;
use crate::properties::TableProperties;
use crate::schema::Schema;
use crate::snapshot::Snapshot;
use crate::table::Table;

/// Builds version 0 of a table with a schema and no data.
#[derive(Debug)]
pub struct CreateBuilder {
    table: Table,
    schema: Option<Schema>,
    partition_columns: Vec<String>,
    name: Option<String>,
    description: Option<String>,
    configuration: BTreeMap<String, String>,
    mode: SaveMode,
}

impl CreateBuilder {
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            schema: None,
            partition_columns: Vec::new(),
            name: None,
            description: None,
            configuration: BTreeMap::new(),
            mode: SaveMode::ErrorIfExists,
        }
    }

    /// Table schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Partition columns, in directory order.
    #[must_use]
    pub fn with_partition_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.partition_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Table name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Table description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets one table property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Replaces the table properties.
    #[must_use]
    pub fn with_configuration(mut self, configuration: BTreeMap<String, String>) -> Self {
        self.configuration = configuration;
        self
    }

    /// `ErrorIfExists` (default) or `Ignore`.
    #[must_use]
    pub fn with_save_mode(mut self, mode: SaveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Commits version 0.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a missing schema, bad partition columns,
    /// bad properties or an unsupported mode; `TableAlreadyExists` when a
    /// log exists and the mode is `ErrorIfExists`.
    pub async fn execute(self) -> Result<Table> {
        let span = table_span("create", self.table.uri());
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> Result<Table> {
        let Self {
            table,
            schema,
            partition_columns,
            name,
            description,
            configuration,
            mode,
        } = self;

        if !matches!(mode, SaveMode::ErrorIfExists | SaveMode::Ignore) {
            return Err(TableError::validation(format!(
                "create supports ErrorIfExists and Ignore, not {}",
                mode.as_str()
            )));
        }
        let schema = schema.ok_or_else(|| TableError::validation("create requires a schema"))?;
        schema.validate_partition_columns(&partition_columns)?;
        TableProperties::validate(&configuration)?;

        let metadata = Metadata {
            id: Uuid::now_v7().to_string(),
            name,
            description,
            schema,
            partition_columns,
            configuration,
            created_time: Utc::now().timestamp_millis(),
        };
        let mut planner = CreatePlanner {
            mode,
            location: table.uri().to_string(),
            metadata,
        };

        let current = table.latest_or_none().await?;
        let committed = Committer::new(table.log(), table.config())
            .run(current, &mut planner)
            .await?;
        if committed.committed {
            info!(metric = "tidal_create", uri = %table.uri(), "table created");
        }
        Ok(table.with_snapshot(committed.snapshot))
    }
}

struct CreatePlanner {
    mode: SaveMode,
    location: String,
    metadata: Metadata,
}

#[async_trait]
impl CommitPlanner for CreatePlanner {
    type Output = ();

    async fn plan(&mut self, snapshot: Option<&Arc<Snapshot>>) -> Result<Planned<()>> {
        if snapshot.is_some() {
            return match self.mode {
                SaveMode::Ignore => Ok(Planned::Noop(())),
                _ => Err(TableError::TableAlreadyExists {
                    location: self.location.clone(),
                }),
            };
        }
        let mut prepared = PreparedCommit::new(Operation::Create {
            mode: self.mode,
            location: self.location.clone(),
            partition_by: self.metadata.partition_columns.clone(),
        });
        prepared.actions.push(Action::MetaData(self.metadata.clone()));
        Ok(Planned::Commit(prepared, ()))
    }
}
