use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use treport::{to_response, Config, ScanContext, Scanner, Strategy, TypedPayload};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Marker {
    tag: String,
}

impl TypedPayload for Marker {
    const TYPE_NAME: &'static str = "treport.test.Marker";
}

#[tokio::test]
async fn test_scan_with_no_pipelines_creates_mount_point() {
    let temp = TempDir::new().unwrap();
    let mount = temp.path().join("state");
    let yaml = format!(
        r#"
project:
  path: {}
pipelines: []
"#,
        mount.display()
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();

    Scanner::new(config).scan().await.unwrap();
    assert!(mount.exists());
}

#[test]
fn test_config_shapes_from_readme_examples() {
    let yaml = r#"
plugin:
  scanner:
    - size
pipelines:
  - name: sizes
    strategy: headOnly
    repository:
      - repo: https://github.com/acme/widget
    steps:
      - size
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.pipelines[0].strategy, Strategy::HeadOnly);
    assert_eq!(config.pipelines[0].steps[0].analyzers[0].name, "size");
}

#[test]
fn test_typed_data_flows_between_analyzers() {
    let mut scanctx = ScanContext::default();
    assert!(scanctx.get_data::<Marker>().is_err());

    let response = to_response(&Marker { tag: "from-a".into() }).unwrap();
    scanctx.store_result("analyzer-a", response);

    // A different analyzer reads the payload back by type.
    let marker: Marker = scanctx.get_data().unwrap();
    assert_eq!(marker.tag, "from-a");
    assert_eq!(
        scanctx.produced_type("analyzer-a"),
        Some("treport.test.Marker")
    );
}
