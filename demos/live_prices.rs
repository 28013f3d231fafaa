use market_data_sync::{MarketDataSync, Page, SyncConfig};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("Live Market Data Example");
    println!("========================");

    let config = SyncConfig::from_env()?;
    let binding = MarketDataSync::new(config)?.bootstrap().await?;
    println!("Loaded {} pages of ranked assets", binding.page_count());

    binding.start(Page(0)).await?;

    for round in 0..10 {
        sleep(Duration::from_secs(3)).await;

        // flip to the second page halfway through
        if round == 5 && binding.page_count() > 1 {
            binding.switch_page(Page(1)).await?;
        }

        let summary = binding.status_summary();
        println!(
            "\n{:-<60}\n{} | page {:?} | coverage {:.1}% | {} updates",
            "", summary.label, summary.page, summary.coverage, summary.update_count
        );
        if let Some(error) = &summary.last_error {
            println!("last error: {}", error);
        }

        let resolution = binding.manager().resolution();
        let page_ids = resolution.mapped.keys().chain(resolution.unmapped.iter());
        for asset_id in page_ids {
            match binding.price(asset_id) {
                Ok(record) => println!(
                    "{:<16} {:>14} {:>8}%  ({})",
                    record.asset_id, record.price, record.change_24h, record.source
                ),
                Err(_) => println!("{:<16} {:>14}", asset_id, "waiting"),
            }
        }
        if !binding.unmapped().is_empty() {
            println!("unmapped: {:?}", binding.unmapped());
        }
    }

    for metrics in binding.feed_metrics().await {
        println!(
            "{}: p50={:.0}ms p99={:.0}ms success_rate={:.1}%",
            metrics.operation,
            metrics.latency_p50_ms,
            metrics.latency_p99_ms,
            metrics.success_rate * 100.0
        );
    }

    binding.shutdown().await?;
    Ok(())
}
