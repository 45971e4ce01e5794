//! Test the admin command line against a config file.
//!
//! Logging can only be set up once per process, so this runs a single
//! command through the full path and the rest against the engine.

use clap::Parser;

use refold::cli::{Command, Options};
use refold::engine::Engine;

mod common;

use common::{CART, TestConfig};

#[tokio::test]
async fn admin_commands() {
    let (config, dir) = TestConfig::file_storage().finalize();
    let dir = dir.unwrap();

    let config_file = dir.path().join("refold.conf");
    std::fs::write(
        &config_file,
        format!(
            "storage_uri = \"{}\"\nlog_level = \"warn\"\npage_size = 2\n",
            config.storage_uri
        ),
    )
    .unwrap();

    {
        let engine = Engine::from_config(common::registry(), &config).unwrap();
        for id in ["c1", "c2", "c3"] {
            common::create_cart(&engine, id, "alice").await;
        }
    }

    let options = Options::try_parse_from([
        "refold",
        "--config",
        config_file.to_str().unwrap(),
        "touch",
        CART,
    ])
    .unwrap();
    let report = refold::cli::run_with(options, common::registry()).await.unwrap();
    assert_eq!(report, "Cart: FINISHED, processed 3, changed 0");

    let engine = Engine::from_config(common::registry(), &config).unwrap();

    let report = Command::Validate.run(&engine).await.unwrap();
    assert!(report.contains("entity 'Cart' at version 2"));
    assert!(report.contains("event 'ItemAdded' at version 2"));
    assert!(report.contains("read model 'CartView' at version 2"));

    let report = Command::Rebuild {
        entity_type: CART.to_string(),
        entity_id: "c2".to_string(),
    }
    .run(&engine)
    .await
    .unwrap();
    assert!(report.starts_with("Rebuilt"));

    let report = Command::Rebuild {
        entity_type: CART.to_string(),
        entity_id: "c9".to_string(),
    }
    .run(&engine)
    .await
    .unwrap();
    assert_eq!(report, "No events for 'Cart/c9'");

    let report = Command::Migrate { concept: None }.run(&engine).await.unwrap();
    assert!(report.contains("Cart: FINISHED, processed 3, changed 0"));
    assert!(report.contains("CartView: FINISHED, processed 3, changed 0"));

    let unknown = Command::Touch {
        entity_type: "Basket".to_string(),
    }
    .run(&engine)
    .await;
    assert!(unknown.is_err());
}
