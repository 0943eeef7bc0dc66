//! Application wiring.
//!
//! Builds the realtime plane, the REST clients, the data fetcher and
//! the control loop for the configured currency, then runs until a
//! shutdown signal arrives.

use crate::config::Config;
use crate::error::{AppError, AppResult};
use bfx_client::{BfxPrivateClient, BfxPublicClient};
use bfx_engine::{ControlLoop, DataFetcher, Engine, Executor};
use bfx_ws::RtPublicClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const REALTIME_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

pub struct Application {
    config: Config,
}

impl Application {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, api_key: String, api_secret: Vec<u8>) -> AppResult<()> {
        let stop = CancellationToken::new();

        let public = Arc::new(BfxPublicClient::new()?);
        let private = Arc::new(BfxPrivateClient::new(api_key, api_secret)?);
        let rt = RtPublicClient::new(REALTIME_URL);

        let rt_task = {
            let rt = rt.clone();
            tokio::spawn(async move { rt.run().await })
        };

        let agent = {
            let config = &self.config;
            let rt = rt.clone();
            let stop = stop.clone();
            async move {
                let fetcher = DataFetcher::new(
                    Arc::clone(&public),
                    rt,
                    &config.currency,
                    stop.child_token(),
                )
                .await?;
                fetcher.start().await?;
                info!(currency = %config.currency, "market data plane running");

                let engine = Engine::new(config.engine_config(), fetcher.markets());
                let executor = Executor::new(Arc::clone(&private), &config.currency);
                let cycle = ControlLoop::new(
                    engine,
                    executor,
                    fetcher,
                    Arc::clone(&private),
                    stop.child_token(),
                );
                cycle.run().await;
                Ok::<(), AppError>(())
            }
        };
        tokio::pin!(agent);

        let result = tokio::select! {
            res = &mut agent => res,

            joined = rt_task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "realtime plane failed fatally");
                    Err(AppError::Ws(e))
                }
                Err(e) => Err(AppError::Config(format!("realtime task panicked: {e}"))),
            },

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                Ok(())
            }
        };

        stop.cancel();
        rt.stop();
        result
    }
}
