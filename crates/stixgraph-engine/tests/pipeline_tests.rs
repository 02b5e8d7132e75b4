use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use stixgraph_cape::{CapeReport, Enrichment};
use stixgraph_engine::*;
use stixgraph_store::{BaselineSoftware, BenignTable, Bundle};

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_report() -> Value {
        json!({
            "info": {
                "version": "2.4-CAPE",
                "started": "2023-05-02 08:00:00",
                "ended": "2023-05-02 08:04:00",
                "package": "exe",
                "parent_sample": {"sha256": "5f2b7c0d"},
                "machine": {
                    "name": "win10",
                    "manager": "KVM",
                    "started_on": "2023-05-02 08:00:01",
                    "shutdown_on": "2023-05-02 08:03:59"
                }
            },
            "target": {"category": "file", "file": {
                "name": "invoice.exe", "size": 2048, "sha256": "5f2b7c0d", "md5": "0a1b"
            }},
            "behavior": {
                "processes": [
                    {"process_id": 10, "parent_id": 1, "environ": {"CommandLine": "invoice.exe"}},
                    {"process_id": 11, "parent_id": 10, "environ": {"CommandLine": "reg.exe add"}}
                ],
                "summary": {
                    "read_files": ["C:\\Windows\\System32\\kernel32.dll"],
                    "write_files": ["C:\\Users\\bob\\AppData\\x.tmp"],
                    "delete_files": [],
                    "read_keys": ["HKEY_LOCAL_MACHINE\\Foo"],
                    "write_keys": ["HKEY_LOCAL_MACHINE\\Foo"],
                    "mutexes": ["Global\\evil"]
                }
            },
            "network": {
                "tcp": [{"src": "192.168.56.10", "dst": "203.0.113.5", "sport": 50000, "dport": 443}],
                "hosts": [{"ip": "203.0.113.5", "country_name": "Netherlands", "hostname": "c2.example.net"}],
                "domains": [{"domain": "c2.example.net"}]
            },
            "ttps": [{"signature": "injection", "ttps": ["T1055"]}]
        })
    }

    fn types(bundle: &Bundle) -> HashSet<String> {
        bundle
            .objects
            .iter()
            .filter_map(|o| o["type"].as_str().map(str::to_string))
            .collect()
    }

    fn assert_no_dangling(bundle: &Bundle) {
        let ids: HashSet<&str> = bundle.objects.iter().filter_map(|o| o["id"].as_str()).collect();
        for edge in bundle.objects_of_type("relationship") {
            assert!(ids.contains(edge["source_ref"].as_str().unwrap()));
            assert!(ids.contains(edge["target_ref"].as_str().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_full_conversion() {
        let converter = Converter::new(ConverterConfig::default());
        let conversion = converter.convert_value(create_test_report()).await.unwrap();
        let bundle = &conversion.bundle;

        let seen = types(bundle);
        for expected in [
            "malware",
            "malware-analysis",
            "software",
            "process",
            "file",
            "directory",
            "windows-registry-key",
            "mutex",
            "attack-pattern",
            "domain-name",
            "ipv4-addr",
            "network-traffic",
            "location",
            "relationship",
        ] {
            assert!(seen.contains(expected), "missing {}", expected);
        }

        // The same key read and written is one entity with two edges
        assert_eq!(bundle.objects_of_type("windows-registry-key").count(), 1);
        let malware = bundle.objects_of_type("malware").next().unwrap();
        assert_eq!(malware["name"], "5f2b7c0d");

        assert_no_dangling(bundle);
        assert_eq!(conversion.stats.relationships, bundle.objects_of_type("relationship").count());
    }

    #[tokio::test]
    async fn test_stage_order() {
        let converter = Converter::new(ConverterConfig::default());
        let conversion = converter.convert_value(create_test_report()).await.unwrap();
        let stages: Vec<Stage> = conversion.stages().collect();

        assert_eq!(stages[0], Stage::Loaded);
        assert_eq!(stages[1], Stage::MalwareIdentified);
        assert_eq!(stages[2], Stage::AnalysisMapped);
        assert_eq!(*stages.last().unwrap(), Stage::Exported);
        assert!(!stages.contains(&Stage::BenignFiltered));
        assert!(!stages.contains(&Stage::Reported));
    }

    #[tokio::test]
    async fn test_small_mode_excludes_files_and_registry() {
        let config = ConverterConfig {
            small: true,
            ..Default::default()
        };
        let full = Converter::new(ConverterConfig::default())
            .convert_value(create_test_report())
            .await
            .unwrap();
        let small = Converter::new(config)
            .convert_value(create_test_report())
            .await
            .unwrap();

        for excluded in ["file", "directory", "windows-registry-key"] {
            assert_eq!(small.bundle.objects_of_type(excluded).count(), 0);
        }
        for kept in ["process", "mutex", "domain-name", "network-traffic"] {
            assert_eq!(
                small.bundle.objects_of_type(kept).count(),
                full.bundle.objects_of_type(kept).count(),
                "{} changed in small mode",
                kept
            );
        }
        assert_no_dangling(&small.bundle);
    }

    #[tokio::test]
    async fn test_missing_target_is_rejected() {
        let converter = Converter::new(ConverterConfig::default());
        let mut report = create_test_report();
        report.as_object_mut().unwrap().remove("target");

        let err = converter.convert_value(report).await.unwrap_err();
        assert!(matches!(err, ConversionError::Mapping(_)));
        assert!(!err.is_usage_error());
    }

    #[tokio::test]
    async fn test_missing_optional_sections() {
        let converter = Converter::new(ConverterConfig::default());
        let report = json!({
            "info": {"ended": "2023-05-02 08:04:00", "parent_sample": {}},
            "target": {"category": "url"}
        });

        let conversion = converter.convert_value(report).await.unwrap();
        assert_eq!(conversion.bundle.objects_of_type("malware").count(), 1);
        assert_eq!(conversion.bundle.objects_of_type("malware-analysis").count(), 1);
        assert_eq!(conversion.bundle.objects_of_type("process").count(), 0);
    }

    #[tokio::test]
    async fn test_benign_filter_removes_baseline_objects() {
        let clean = Converter::new(ConverterConfig::default())
            .convert_value(create_test_report())
            .await
            .unwrap();

        let mut table = BenignTable::new();
        table.index_bundle(&clean.bundle, &BaselineSoftware::default());
        let converter = Converter::new(ConverterConfig::default()).with_benign(Arc::new(table));

        let conversion = converter.convert_value(create_test_report()).await.unwrap();
        let bundle = &conversion.bundle;

        // Opaque-identity entities survive, content-derived ones were indexed
        assert_eq!(bundle.objects_of_type("malware").count(), 1);
        assert_eq!(bundle.objects_of_type("process").count(), 2);
        assert_eq!(bundle.objects_of_type("mutex").count(), 0);
        assert_eq!(bundle.objects_of_type("windows-registry-key").count(), 0);
        // Baseline software is never indexed
        assert_eq!(bundle.objects_of_type("software").count(), 2);
        assert!(conversion.stats.benign_entities_removed > 0);
        assert!(conversion.stages().any(|s| s == Stage::BenignFiltered));
        assert_no_dangling(bundle);
    }

    #[tokio::test]
    async fn test_report_wrapper_references_entities() {
        let config = ConverterConfig {
            report_wrapper: true,
            ..Default::default()
        };
        let conversion = Converter::new(config)
            .convert_value(create_test_report())
            .await
            .unwrap();

        let report = conversion.bundle.objects_of_type("report").next().unwrap();
        assert_eq!(report["report_types"], json!(["malware"]));
        assert_eq!(report["published"], "2023-05-02T08:04:00.000Z");
        let refs = report["object_refs"].as_array().unwrap();
        assert_eq!(refs.len(), conversion.stats.entities - 1);
    }

    #[test]
    fn test_disallow_custom_omits_extensions() {
        let report = CapeReport::from_value(create_test_report()).unwrap();
        let enrichment = Enrichment {
            reputation_tags: Some(vec!["trojan".into()]),
            ..Default::default()
        };

        let allowed = Converter::new(ConverterConfig::default())
            .convert_report(&report, &enrichment)
            .unwrap();
        assert_eq!(allowed.bundle.objects_of_type("extension-definition").count(), 1);

        let config = ConverterConfig {
            allow_custom: false,
            ..Default::default()
        };
        let denied = Converter::new(config).convert_report(&report, &enrichment).unwrap();
        assert_eq!(denied.bundle.objects_of_type("extension-definition").count(), 0);
        let malware = denied.bundle.objects_of_type("malware").next().unwrap();
        assert!(malware.get("extensions").is_none());
    }

    #[tokio::test]
    async fn test_convert_path_writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("report.json");
        let output = dir.path().join("out").join("report.json");
        tokio::fs::write(&input, create_test_report().to_string()).await.unwrap();

        let converter = Converter::new(ConverterConfig::default());
        let conversion = converter.convert_path(&input, Some(&output)).await.unwrap();

        let written = Bundle::read_from(&output).await.unwrap();
        assert_eq!(written.len(), conversion.bundle.len());
    }

    #[tokio::test]
    async fn test_from_config_survives_bad_benign_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConverterConfig {
            benign_dir: Some(dir.path().join("missing")),
            ..Default::default()
        };
        let converter = Converter::from_config(config).await.unwrap();
        assert!(!converter.has_benign_table());
    }
}
