//! Sink construction from the blueprint

use std::sync::Arc;

use contracts::{PipelineBlueprint, SinkKind, SinkWriter, SinksConfig, WarehouseTableKind};
use tracing::{debug, info, instrument};

use crate::dead_letter::{replay_dead_letters, ReplayReport};
use crate::error::DispatcherError;
use crate::handle::{SinkHandle, SinkMonitor};
use crate::sinks::{
    AggregationStore, CacheSink, ExternalSink, JsonlWarehouseTable, MemoryKeyValueStore,
    MemoryWarehouseTable, WarehouseSink,
};
use crate::state::PipelineState;

/// Running sink handles plus the stores the cache sink writes to
pub struct SinkSet {
    pub handles: Vec<SinkHandle>,
    pub aggregation: Option<Arc<AggregationStore>>,
    pub key_value: Option<MemoryKeyValueStore>,
}

impl SinkSet {
    pub fn new(handles: Vec<SinkHandle>) -> Self {
        Self {
            handles,
            aggregation: None,
            key_value: None,
        }
    }

    pub fn with_aggregation(mut self, aggregation: Arc<AggregationStore>) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_key_value(mut self, store: MemoryKeyValueStore) -> Self {
        self.key_value = Some(store);
        self
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        self.handles.iter().map(SinkHandle::kind).collect()
    }

    pub fn monitors(&self) -> Vec<SinkMonitor> {
        self.handles.iter().map(SinkHandle::monitor).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Shut every handle down, letting queued jobs finish
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await;
        }
    }
}

/// Builds the enabled sinks of a blueprint on top of shared pipeline state.
///
/// The in-process cache store and warehouse table can be injected so callers
/// (tests, the operator) can look at what the sinks wrote.
pub struct DispatcherBuilder {
    sinks: SinksConfig,
    state: PipelineState,
    key_value_store: Option<MemoryKeyValueStore>,
    warehouse_table: Option<MemoryWarehouseTable>,
}

impl DispatcherBuilder {
    pub fn new(sinks: SinksConfig, state: PipelineState) -> Self {
        Self {
            sinks,
            state,
            key_value_store: None,
            warehouse_table: None,
        }
    }

    pub fn with_key_value_store(mut self, store: MemoryKeyValueStore) -> Self {
        self.key_value_store = Some(store);
        self
    }

    /// Use `table` instead of the configured warehouse table
    pub fn with_warehouse_table(mut self, table: MemoryWarehouseTable) -> Self {
        self.warehouse_table = Some(table);
        self
    }

    /// Spawn a handle for every enabled sink
    #[instrument(name = "dispatcher_builder_build", skip(self))]
    pub async fn build(self) -> Result<SinkSet, DispatcherError> {
        let enabled = self.sinks.enabled();
        if enabled.is_empty() {
            return Err(DispatcherError::NoSinks);
        }

        let mut handles = Vec::with_capacity(enabled.len());
        let mut aggregation = None;
        let mut key_value = None;
        for kind in enabled {
            let handle = match kind {
                SinkKind::Cache => {
                    let store = Arc::new(AggregationStore::from_config(&self.sinks.cache));
                    aggregation = Some(Arc::clone(&store));
                    let kv = self.key_value_store.clone().unwrap_or_default();
                    key_value = Some(kv.clone());
                    self.spawn(CacheSink::from_config(kv, store, &self.sinks.cache), kind)
                }
                SinkKind::Warehouse => self.create_warehouse_handle()?,
                SinkKind::External => {
                    let sink = ExternalSink::new(&self.sinks.external)
                        .map_err(|e| DispatcherError::sink_creation(kind.as_str(), e.to_string()))?;
                    self.spawn(sink, kind)
                }
            };
            handles.push(handle);
        }

        info!(sinks = ?handles.iter().map(SinkHandle::kind).collect::<Vec<_>>(), "Sinks started");
        let mut set = SinkSet::new(handles);
        set.aggregation = aggregation;
        set.key_value = key_value;
        Ok(set)
    }

    #[instrument(
        name = "dispatcher_create_warehouse_handle",
        skip(self),
        fields(table = ?self.sinks.warehouse.table)
    )]
    fn create_warehouse_handle(&self) -> Result<SinkHandle, DispatcherError> {
        Ok(self.spawn(self.warehouse_sink()?, SinkKind::Warehouse))
    }

    fn warehouse_sink(&self) -> Result<WarehouseSink, DispatcherError> {
        let config = &self.sinks.warehouse;
        if let Some(table) = &self.warehouse_table {
            return Ok(WarehouseSink::from_config(table.clone(), config));
        }
        Ok(match config.table {
            WarehouseTableKind::Memory => {
                WarehouseSink::from_config(MemoryWarehouseTable::new(), config)
            }
            WarehouseTableKind::Jsonl => {
                let table = JsonlWarehouseTable::open(&config.dir)
                    .map_err(|e| DispatcherError::sink_creation("warehouse", e.to_string()))?;
                WarehouseSink::from_config(table, config)
            }
        })
    }

    /// Push the pending dead letters of `kind` through a freshly built
    /// writer for that sink. The sink does not have to be enabled.
    #[instrument(name = "dispatcher_replay_dead_letters", skip(self))]
    pub async fn replay_dead_letters(&self, kind: SinkKind) -> Result<ReplayReport, DispatcherError> {
        match kind {
            SinkKind::Cache => {
                let store = Arc::new(AggregationStore::from_config(&self.sinks.cache));
                let kv = self.key_value_store.clone().unwrap_or_default();
                let sink = CacheSink::from_config(kv, store, &self.sinks.cache);
                self.replay_with(sink).await
            }
            SinkKind::Warehouse => self.replay_with(self.warehouse_sink()?).await,
            SinkKind::External => {
                let sink = ExternalSink::new(&self.sinks.external)
                    .map_err(|e| DispatcherError::sink_creation(kind.as_str(), e.to_string()))?;
                self.replay_with(sink).await
            }
        }
    }

    async fn replay_with<W>(&self, writer: W) -> Result<ReplayReport, DispatcherError>
    where
        W: SinkWriter + Sync,
    {
        let report = replay_dead_letters(&self.state.dead_letters, &writer).await;
        writer.close().await?;
        Ok(report?)
    }

    fn spawn<W>(&self, writer: W, kind: SinkKind) -> SinkHandle
    where
        W: SinkWriter + Sync + 'static,
    {
        debug!(sink = %kind, "Spawning sink handle");
        SinkHandle::spawn(
            writer,
            &self.sinks.delivery(kind),
            Arc::clone(&self.state.ledger),
            Arc::clone(&self.state.dead_letters),
        )
    }
}

/// Build every enabled sink of `blueprint`
#[instrument(name = "dispatcher_create_sinks", skip_all)]
pub async fn create_sinks(
    blueprint: &PipelineBlueprint,
    state: &PipelineState,
) -> Result<SinkSet, DispatcherError> {
    DispatcherBuilder::new(blueprint.sinks.clone(), state.clone())
        .build()
        .await
}
