use console_sync::Console;
use console_sync::usage::{
    AccountLoadStats, aggregate, calculate_recent_per_minute_rates, collect_usage_details,
};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;

use crate::commands::session::ensure_session;
use crate::{CliError, CliResult, UsageArgs};

fn print_table(title: &str, rows: &BTreeMap<String, AccountLoadStats>) {
    println!("{}", title.bold());
    if rows.is_empty() {
        println!("  (none)");
        return;
    }
    println!(
        "{}",
        "  id | requests | success | failure | success_rate | load_rate".bold()
    );
    let mut rows: Vec<&AccountLoadStats> = rows.values().collect();
    rows.sort_by(|a, b| b.total_requests.cmp(&a.total_requests).then(a.id.cmp(&b.id)));
    for r in rows {
        let rate = format!("{:.2}%", r.success_rate);
        let rate = if r.success_rate < 90.0 {
            rate.red().to_string()
        } else {
            rate.green().to_string()
        };
        println!(
            "  {} | {} | {} | {} | {} | {:.2}%",
            r.id, r.total_requests, r.success_count, r.failure_count, rate, r.load_rate
        );
    }
}

pub async fn handle_usage_cmd(console: &Console, args: UsageArgs) -> CliResult<()> {
    ensure_session(console).await?;
    let payload = console.usage_store().refresh().await?;
    let details = collect_usage_details(&payload);
    let window = args
        .window_minutes
        .unwrap_or(console.settings.usage.rate_window_minutes);
    let agg = aggregate(&details);
    let rates = calculate_recent_per_minute_rates(&details, window, console.clock.now_ms());

    if args.json {
        let out = serde_json::json!({ "aggregate": agg, "recent": rates });
        let text = serde_json::to_string_pretty(&out).map_err(|e| CliError::Other(e.into()))?;
        println!("{text}");
        return Ok(());
    }

    println!("{} {}", "Total requests:".bold(), agg.total_requests);
    println!(
        "Last {} min: {:.2} req/min, {:.2} tokens/min ({} requests, {} tokens)",
        rates.window_minutes,
        rates.requests_per_minute,
        rates.tokens_per_minute,
        rates.request_count,
        rates.token_count
    );
    println!();
    print_table("By source", &agg.by_source);
    println!();
    print_table("By auth index", &agg.by_auth_index);
    Ok(())
}
