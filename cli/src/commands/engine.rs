use clap::Subcommand;
use serde_json::{Value, json};

use qlik_core::QlikConfig;
use qlik_engine::{DimensionSpec, EngineClient, EngineError, MeasureSpec, analyze};

#[derive(Subcommand)]
pub enum EngineCommands {
    /// List every field in the app's data model
    Fields {
        app_id: String,
    },
    /// List tables with their field names
    Tables {
        app_id: String,
    },
    /// Extract rows of one data-model table
    TableData {
        app_id: String,
        table: String,
        #[arg(long, default_value_t = 1000)]
        max_rows: usize,
    },
    /// Distinct values of one field
    FieldValues {
        app_id: String,
        field: String,
        #[arg(long, default_value_t = 100)]
        max_values: usize,
        /// Skip per-value frequency counts
        #[arg(long)]
        no_frequency: bool,
    },
    /// Statistical profile of one field
    FieldStats {
        app_id: String,
        field: String,
    },
    /// Run a dimensions/measures aggregation
    Hypercube {
        app_id: String,
        /// Dimension field, repeatable
        #[arg(long = "dim")]
        dimensions: Vec<String>,
        /// Measure expression (e.g. 'Sum([Sales])'), repeatable
        #[arg(long = "measure")]
        measures: Vec<String>,
        #[arg(long, default_value_t = 1000)]
        max_rows: usize,
    },
    /// Evaluate one expression against the app
    Eval {
        app_id: String,
        expression: String,
    },
    /// Show the current selection state
    Selections {
        app_id: String,
    },
    /// Report which sheets and objects reference which fields
    FieldUsage {
        app_id: String,
    },
}

impl EngineCommands {
    fn app_id(&self) -> &str {
        match self {
            Self::Fields { app_id }
            | Self::Tables { app_id }
            | Self::TableData { app_id, .. }
            | Self::FieldValues { app_id, .. }
            | Self::FieldStats { app_id, .. }
            | Self::Hypercube { app_id, .. }
            | Self::Eval { app_id, .. }
            | Self::Selections { app_id }
            | Self::FieldUsage { app_id } => app_id,
        }
    }
}

pub async fn run(command: EngineCommands) -> Result<(), Box<dyn std::error::Error>> {
    let config = QlikConfig::from_env()?;
    let mut client = EngineClient::connect(&config).await?;
    let outcome = execute(&mut client, command).await;
    client.disconnect().await;
    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn execute(
    client: &mut EngineClient,
    command: EngineCommands,
) -> Result<Value, EngineError> {
    let app_id = command.app_id().to_string();
    let app_handle = client.open_doc(&app_id, false).await?;

    let result = match command {
        EngineCommands::Fields { .. } => client.fields(app_handle).await,
        EngineCommands::Tables { .. } => client.tables_overview(app_handle).await,
        EngineCommands::TableData {
            table, max_rows, ..
        } => client.table_data(app_handle, &table, max_rows).await,
        EngineCommands::FieldValues {
            field,
            max_values,
            no_frequency,
            ..
        } => {
            client
                .field_values(app_handle, &field, max_values, !no_frequency)
                .await
        }
        EngineCommands::FieldStats { field, .. } => {
            client.field_statistics(app_handle, &field).await
        }
        EngineCommands::Hypercube {
            dimensions,
            measures,
            max_rows,
            ..
        } => {
            let dimensions: Vec<DimensionSpec> =
                dimensions.into_iter().map(DimensionSpec::new).collect();
            let measures: Vec<MeasureSpec> =
                measures.into_iter().map(MeasureSpec::new).collect();
            client
                .hypercube(app_handle, dimensions, measures, max_rows)
                .await
        }
        EngineCommands::Eval { expression, .. } => {
            let value = client.evaluate(app_handle, &expression).await?;
            Ok(json!({ "expression": expression, "result": value }))
        }
        EngineCommands::Selections { .. } => {
            let selections = client.current_selections(app_handle).await?;
            Ok(json!({ "selections": selections }))
        }
        EngineCommands::FieldUsage { .. } => analyze::field_usage(client, app_handle).await,
    };

    // Disconnect follows immediately; close failures are ignored.
    let _ = client.close_doc(app_handle).await;
    result
}
