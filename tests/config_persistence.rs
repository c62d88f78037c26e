//! Config file round trips and their effect on a running client.

use courier::{Client, ClientOptions, CommandKind, Config, InMemoryBroker};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = Config::default();
    config.config_path = path.clone();
    config.group_name = "billing".into();
    config.default_invoke_timeout_ms = 2_500;
    config.ordered_notice.threads = Some(2);
    config.save().await.unwrap();

    let loaded = Config::load_from(&path).await.unwrap();
    assert_eq!(loaded.group_name, "billing");
    assert_eq!(loaded.default_invoke_timeout(), Duration::from_millis(2_500));
    assert_eq!(loaded.consumer(CommandKind::OrderedNotice).threads, 2);
    assert_eq!(loaded.config_path, path);
}

#[tokio::test]
async fn partial_file_takes_defaults_for_missing_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    tokio::fs::write(
        &path,
        "group_name = \"search\"\n\n[notice]\nexecutable = false\n",
    )
    .await
    .unwrap();

    let config = Config::load_from(&path).await.unwrap();
    assert_eq!(config.group_name, "search");
    assert!(!config.consumer(CommandKind::Notice).executable);
    assert!(config.consumer(CommandKind::Invoke).executable);
    assert_eq!(config.consumer(CommandKind::Invoke).threads, 10);
    assert_eq!(config.consumer(CommandKind::Invoke).max_reconsume_times, 0);
    assert_eq!(config.broker.queue_count, 4);
}

#[tokio::test]
async fn invalid_values_are_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    tokio::fs::write(&path, "group_name = \"search\"\ntopic_queue_count = 0\n")
        .await
        .unwrap();

    let error = Config::load_from(&path).await.unwrap_err();
    assert!(error.to_string().contains("topic_queue_count"));
}

#[tokio::test]
async fn disabled_sections_keep_their_consumer_group_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    tokio::fs::write(
        &path,
        "group_name = \"search\"\n\n[ordered_notice]\nexecutable = false\n",
    )
    .await
    .unwrap();
    let config = Config::load_from(&path).await.unwrap();

    let broker = InMemoryBroker::with_options(config.broker_options());
    let client = Client::new(ClientOptions::from_config(&config), Arc::new(broker.clone()));
    client.register([courier::HandlerRegistration::new(
        "index",
        "rebuild",
        courier::Capabilities::ALL,
        courier::handler_fn(|_params: courier::HandlerParams| async move {
            Ok(courier::HandlerResult::empty())
        }),
    )]);
    client.start().await.unwrap();

    let groups = broker.active_consumer_groups();
    assert!(groups.contains(&"CONSUMER_search_INVOKE".to_string()));
    assert!(!groups.contains(&"CONSUMER_search_ORDERED_NOTICE".to_string()));

    client.shutdown().await;
}
