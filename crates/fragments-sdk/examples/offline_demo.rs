//! 离线同步演示
//!
//! 断网时写入离线队列，恢复连接后回放。
//! 需要一个可访问的 fragments 服务（`FRAGMENTS_API_URL`，默认 http://localhost:8080）。

use fragments_sdk::{FragmentsConfig, FragmentsSDK, NetworkStatus, SDKEvent};
use futures::future::join_all;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 离线同步演示\n");
    println!("====================================\n");

    let token = std::env::var("FRAGMENTS_TOKEN").unwrap_or_else(|_| "user1@email.com:password1".to_string());
    let config = FragmentsConfig::builder()
        .in_memory(true)
        .token(token)
        .owner_id("demo-owner")
        .build();

    println!("📦 正在初始化 SDK (api_url: {})...", config.api_url);
    let sdk = FragmentsSDK::initialize(config).await?;

    // 打印事件
    let mut events = sdk.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SDKEvent::MutationQueued { sequence_id, kind, fragment_id, .. } => {
                    println!("   📥 入队 #{} {} {}", sequence_id, kind, fragment_id);
                }
                SDKEvent::MutationReplayed { sequence_id, kind, fragment_id, .. } => {
                    println!("   ✅ 回放 #{} {} -> {}", sequence_id, kind, fragment_id);
                }
                SDKEvent::MutationDiscarded { sequence_id, error, .. } => {
                    println!("   🗑️ 丢弃 #{}: {}", sequence_id, error);
                }
                other => println!("   📣 {}", other.event_type()),
            }
        }
    });

    println!("\n【模拟断网】");
    sdk.set_network_status(NetworkStatus::Offline).await;

    let drafts = ["# 第一篇", "# 第二篇", "# 第三篇"];
    let results = join_all(drafts.iter().map(|text| sdk.create_fragment("text/markdown", *text))).await;
    for result in results {
        let fragment = result?;
        println!("   本地创建: {} ({}B)", fragment.id, fragment.size);
    }
    println!("   待回放: {} 条", sdk.pending_count().await?);
    println!("   本地列表: {} 条", sdk.load_fragments().await?.len());

    println!("\n【恢复连接】");
    match sdk.set_network_status(NetworkStatus::Online).await {
        Some(report) => {
            println!("   回放 {} 条, 丢弃 {} 条, 剩余 {} 条", report.replayed, report.discarded, report.remaining);
            if let Some(error) = report.error {
                println!("   ⚠️ 回放中断: {}（服务是否已启动？）", error);
            }
        }
        None => println!("   没有触发回放"),
    }

    println!("\n【同步状态】");
    println!("{}", sdk.sync_status().await.summary());

    sdk.shutdown().await;
    Ok(())
}
