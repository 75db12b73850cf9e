//! Plugins bundled with the host binary.

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::catalog::{CatalogError, PluginCatalog, PluginDefinition};
use crate::plugin_api::{PluginContext, PluginHooks, PluginUnit, Teardown};

pub fn catalog() -> Result<PluginCatalog, CatalogError> {
    PluginCatalog::new(vec![
        PluginDefinition::builder("clock", "Clock")
            .description("Logs the local time on a fixed interval")
            .default_config(json!({ "intervalSecs": 60, "format": "%H:%M" }))
            .backend(PluginUnit::hooks(Clock::default))
            .build()?,
        PluginDefinition::builder("boop-counter", "Boop Counter")
            .description("Counts how many times window content finished loading")
            .default_config(json!({ "total": 0 }))
            .frontend(PluginUnit::hooks(BoopCounter::default))
            .build()?,
        PluginDefinition::builder("window-title", "Window Title")
            .description("Shows the configured title on every window")
            .default_config(json!({ "title": "Shell" }))
            .backend(PluginUnit::function(window_title))
            .build()?,
        PluginDefinition::builder("in-app-menu", "In-App Menu")
            .description("Replaces the native menu bar")
            .restart_required(true)
            .backend(PluginUnit::function(|ctx, _config| async move {
                log::info!("In-app menu attached to {}", ctx.window().id());
                Ok(None)
            }))
            .frontend(PluginUnit::function(|ctx, _config| async move {
                log::debug!("In-app menu rendered in {}", ctx.window().id());
                Ok(None)
            }))
            .build()?,
    ])
}

#[derive(Default)]
struct Clock {
    ticker: Option<JoinHandle<()>>,
    format: String,
}

impl Clock {
    fn restart(&mut self, config: &Value) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        let secs = config["intervalSecs"].as_u64().unwrap_or(60).max(1);
        self.format = config["format"].as_str().unwrap_or("%H:%M").to_string();

        let format = self.format.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            loop {
                interval.tick().await;
                log::info!("🕐 {}", Local::now().format(&format));
            }
        }));
    }
}

#[async_trait]
impl PluginHooks for Clock {
    async fn start(&mut self, _ctx: PluginContext, config: Value) -> anyhow::Result<()> {
        self.restart(&config);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        Ok(())
    }

    async fn on_config_change(&mut self, config: Value) -> anyhow::Result<()> {
        self.restart(&config);
        Ok(())
    }
}

#[derive(Default)]
struct BoopCounter {
    ctx: Option<PluginContext>,
    total: u64,
}

#[async_trait]
impl PluginHooks for BoopCounter {
    async fn start(&mut self, ctx: PluginContext, config: Value) -> anyhow::Result<()> {
        self.total = config["total"].as_u64().unwrap_or(0);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.ctx = None;
        Ok(())
    }

    async fn on_content_ready(&mut self) -> anyhow::Result<()> {
        let Some(ctx) = &self.ctx else {
            return Ok(());
        };
        self.total += 1;
        log::info!("Boop #{} in {}", self.total, ctx.window().id());
        ctx.set_config(json!({ "total": self.total })).await
    }
}

async fn window_title(ctx: PluginContext, config: Value) -> anyhow::Result<Option<Teardown>> {
    let window = ctx.window().clone();
    let previous = window.title();
    let title = config["title"].as_str().unwrap_or("Shell");
    window.set_title(title);

    let restore: Teardown = Box::new(move || {
        window.set_title(&previous);
        Ok(())
    });
    Ok(Some(restore))
}
