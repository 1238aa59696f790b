use crate::model::{RunReport, WatermarkEntry};
use crate::pipeline::Pipeline;
use crate::source::{http::build_client, HttpSource, PageSource};
use crate::store::{ConnectionInfo, Store};
use crate::transform::{DbtRunner, TransformOutcome, TransformTrigger};
use sync_core::{Config, Error, Result, RetryPolicy};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct App {
    config: Config,
    store: Arc<Store>,
    sources: Vec<Arc<dyn PageSource>>,
    transform: Arc<dyn TransformTrigger>,
    pipeline: Pipeline,
}

impl App {
    #[instrument(skip(config, pool))]
    pub async fn new(config: Config, pool: PgPool) -> Result<Self> {
        info!("Initializing application");

        let store = Arc::new(Store::new(pool, &config.sync));

        info!("Performing health checks");
        store.health_check().await?;

        // One HTTP session shared by every endpoint
        let client = build_client(&config.api)?;
        let sources = config
            .sources
            .iter()
            .cloned()
            .map(|descriptor| {
                HttpSource::new(client.clone(), &config.api, descriptor)
                    .map(|source| Arc::new(source) as Arc<dyn PageSource>)
            })
            .collect::<Result<Vec<_>>>()?;

        let transform: Arc<dyn TransformTrigger> = Arc::new(DbtRunner::from_config(&config.transform));

        let mut pipeline = sync_pipeline(&store, &config);
        if config.transform.enabled {
            pipeline = pipeline.with_transform(Arc::clone(&transform));
        }

        Ok(Self {
            config,
            store,
            sources,
            transform,
            pipeline,
        })
    }

    /// Syncs every configured source, or just `endpoint` when given.
    pub async fn run(&self, endpoint: Option<&str>, skip_transform: bool) -> Result<RunReport> {
        let selected = match endpoint {
            None => self.sources.clone(),
            Some(name) => {
                let descriptor = self.config.source(name).ok_or_else(|| {
                    Error::Config(format!(
                        "unknown endpoint '{}'; configured: {}",
                        name,
                        self.configured_names().join(", ")
                    ))
                })?;
                self.sources
                    .iter()
                    .filter(|s| s.descriptor() == descriptor)
                    .cloned()
                    .collect()
            }
        };

        if skip_transform {
            info!("Transformation skipped on request");
            return Ok(sync_pipeline(&self.store, &self.config).run(&selected).await);
        }

        Ok(self.pipeline.run(&selected).await)
    }

    /// Runs the transformation on whatever is already landed.
    pub async fn transform_only(&self) -> TransformOutcome {
        self.transform.run().await
    }

    pub async fn check_connection(&self) -> Result<ConnectionInfo> {
        self.store.connection_info().await
    }

    pub async fn list_watermarks(&self) -> Result<Vec<WatermarkEntry>> {
        self.store.list_watermarks().await
    }

    pub async fn reset_watermark(&self, table: &str) -> Result<bool> {
        self.store.reset_watermark(table).await
    }

    fn configured_names(&self) -> Vec<&str> {
        self.config.sources.iter().map(|s| s.name.as_str()).collect()
    }
}

fn sync_pipeline(store: &Arc<Store>, config: &Config) -> Pipeline {
    Pipeline::new(
        store.clone(),
        store.clone(),
        RetryPolicy::from_config(&config.sync),
        config.sync.batch_size,
    )
}
