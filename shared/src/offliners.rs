//! Pure, deterministic construction of the scraper container's command line
//! and docker runtime extras from a task's offliner kind and flags (§6).
//!
//! Grounded line-by-line on the original `utils/offliners.py`: mount point
//! selection, per-offliner argv assembly, flag serialization, and the
//! zimit `shm`/`cap_add` docker extras.

use serde_json::{Map, Value};

use crate::model::{CommandInformation, ResourceSpec, TaskConfig};

const GIB: u64 = 1024 * 1024 * 1024;

/// In-scraper path where ZIM output appears, bind-mounted from the host
/// workdir.
pub fn mount_point_for(offliner: &str) -> &'static str {
    match offliner {
        "phet" => "/phet/dist",
        "sotoki" => "/work",
        _ => "/output",
    }
}

/// Extra docker runtime options keyed by offliner (`cap_add`, `shm`), before
/// the shm-vs-resources clamp in [`expanded_config`].
pub fn docker_config_for(offliner: &str) -> (Vec<&'static str>, Option<u64>) {
    match offliner {
        "zimit" => (vec!["SYS_ADMIN", "NET_ADMIN"], Some(GIB)),
        _ => (vec![], None),
    }
}

/// Flattens a flags map into a flat argv list.
///
/// `true` -> `--key`; `false` -> omitted; list -> repeated `--key="item"` (or
/// `--key item` when `use_equals` is false); scalar -> `--key="value"` (or
/// `--key value`).
pub fn compute_flags(flags: &Map<String, Value>, use_equals: bool) -> Vec<String> {
    let mut params = Vec::new();
    for (key, value) in flags {
        match value {
            Value::Bool(true) => params.push(format!("--{key}")),
            Value::Bool(false) => {}
            Value::Array(items) => {
                for item in items {
                    let rendered = scalar_string(item);
                    if use_equals {
                        params.push(format!("--{key}=\"{rendered}\""));
                    } else {
                        params.push(format!("--{key}"));
                        params.push(rendered);
                    }
                }
            }
            other => {
                let rendered = scalar_string(other);
                if use_equals {
                    params.push(format!("--{key}=\"{rendered}\""));
                } else {
                    params.push(format!("--{key}"));
                    params.push(rendered);
                }
            }
        }
    }
    params
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds the argv passed to `docker run` for one offliner, given its flags
/// and the resolved mount point. `flags` is mutated the way the original
/// mutates its dict in place (gutenberg's conditional key, the
/// output-directory injections) before being flattened.
pub fn command_for(offliner: &str, flags: &Map<String, Value>, mount_point: &str) -> Vec<String> {
    if offliner == "phet" {
        return vec![
            "/bin/bash".into(),
            "-c".into(),
            "'cd /phet && npm i && npm start'".into(),
        ];
    }

    let mut flags = flags.clone();

    if offliner == "sotoki" {
        let domain = flags
            .remove("domain")
            .map(|v| scalar_string(&v))
            .unwrap_or_default();
        let publisher = flags
            .remove("publisher")
            .map(|v| scalar_string(&v))
            .unwrap_or_else(|| "Kiwix".to_string());
        let mut argv = vec!["sotoki".to_string(), domain, publisher];
        argv.extend(compute_flags(&flags, true));
        return argv;
    }

    if offliner == "gutenberg" {
        match flags.get("one-language-one-zim") {
            Some(Value::Bool(true)) => {
                flags.insert(
                    "one-language-one-zim".into(),
                    Value::String(mount_point.to_string()),
                );
            }
            Some(Value::Bool(false)) => {
                flags.remove("one-language-one-zim");
            }
            _ => {}
        }
    }

    let cmd = match offliner {
        "mwoffliner" => {
            flags.insert("outputDirectory".into(), Value::String(mount_point.to_string()));
            "mwoffliner"
        }
        "youtube" => {
            flags.insert("output".into(), Value::String(mount_point.to_string()));
            "youtube2zim-playlists"
        }
        "ted" => {
            flags.insert("output".into(), Value::String(mount_point.to_string()));
            "ted2zim-multi"
        }
        "openedx" => {
            flags.insert("output".into(), Value::String(mount_point.to_string()));
            "openedx2zim"
        }
        "nautilus" => {
            flags.insert("output".into(), Value::String(mount_point.to_string()));
            "nautiluszim"
        }
        "zimit" => {
            flags
                .entry("adminEmail")
                .or_insert_with(|| Value::String("contact+zimfarm@kiwix.org".to_string()));
            flags.insert(
                "statsFilename".into(),
                Value::String(format!("{}/task_progress.json", mount_point_for("zimit"))),
            );
            flags.insert("output".into(), Value::String(mount_point.to_string()));
            "zimit"
        }
        "gutenberg" => "gutenberg2zim",
        other => other,
    };

    let mut argv = vec![cmd.to_string()];
    argv.extend(compute_flags(&flags, true));
    argv
}

/// Expands a task config in place: resolves `mount_point`, `command`,
/// `str_command`, and clamps `resources.shm` against `resources.memory`
/// (taking the larger of the config-supplied and offliner-rule shm size).
pub fn expanded_config(config: &mut TaskConfig) {
    let mount_point = mount_point_for(&config.task_name).to_string();
    let command = command_for(&config.task_name, &config.flags, &mount_point);
    let str_command = command.join(" ");

    let (cap_add, offliner_shm) = docker_config_for(&config.task_name);
    let config_shm = config.resources.shm;
    let dev_shm = match (offliner_shm, config_shm) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    let clamped = dev_shm.map(|shm| shm.min(config.resources.memory));

    config.resources.shm = clamped;
    config.command_information = Some(CommandInformation {
        command,
        str_command,
        mount_point,
        cap_add: cap_add.into_iter().map(String::from).collect(),
    });
}

/// `command_information_for` from the schedule/requested-task POST path
/// (§4.3 step 3): the deterministic snapshot transform applied once, at
/// request time, returning the bits `expanded_config` computes without
/// mutating the caller's `ResourceSpec` directly.
pub fn command_information_for(config: &TaskConfig) -> (CommandInformation, ResourceSpec) {
    let mut cloned = config.clone();
    expanded_config(&mut cloned);
    (cloned.command_information.unwrap(), cloned.resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flags(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn mwoffliner_sets_output_directory() {
        let f = flags(&[("adminEmail", json!("a@b.com"))]);
        let argv = command_for("mwoffliner", &f, "/output");
        assert_eq!(argv[0], "mwoffliner");
        assert!(argv.contains(&"--outputDirectory=\"/output\"".to_string()));
    }

    #[test]
    fn phet_is_special_cased() {
        let f = Map::new();
        let argv = command_for("phet", &f, "/phet/dist");
        assert_eq!(argv, vec!["/bin/bash", "-c", "'cd /phet && npm i && npm start'"]);
    }

    #[test]
    fn sotoki_uses_positional_domain_and_publisher() {
        let f = flags(&[("domain", json!("en.wikipedia.org"))]);
        let argv = command_for("sotoki", &f, "/work");
        assert_eq!(argv[0], "sotoki");
        assert_eq!(argv[1], "en.wikipedia.org");
        assert_eq!(argv[2], "Kiwix");
    }

    #[test]
    fn gutenberg_one_language_one_zim_true_becomes_mount_point() {
        let f = flags(&[("one-language-one-zim", json!(true))]);
        let argv = command_for("gutenberg", &f, "/output");
        assert!(argv.contains(&"--one-language-one-zim=\"/output\"".to_string()));
    }

    #[test]
    fn gutenberg_one_language_one_zim_false_is_dropped() {
        let f = flags(&[("one-language-one-zim", json!(false))]);
        let argv = command_for("gutenberg", &f, "/output");
        assert!(!argv.iter().any(|a| a.contains("one-language-one-zim")));
    }

    #[test]
    fn zimit_defaults_admin_email_and_sets_stats_filename() {
        let f = Map::new();
        let argv = command_for("zimit", &f, "/output");
        assert!(argv.contains(&"--adminEmail=\"contact+zimfarm@kiwix.org\"".to_string()));
        assert!(argv
            .iter()
            .any(|a| a.contains("statsFilename") && a.contains("task_progress.json")));
    }

    #[test]
    fn compute_flags_serializes_bool_list_and_scalar() {
        let f = flags(&[
            ("verbose", json!(true)),
            ("skip", json!(false)),
            ("lang", json!(["en", "fr"])),
            ("threads", json!(4)),
        ]);
        let argv = compute_flags(&f, true);
        assert!(argv.contains(&"--verbose".to_string()));
        assert!(!argv.iter().any(|a| a.contains("skip")));
        assert!(argv.contains(&"--lang=\"en\"".to_string()));
        assert!(argv.contains(&"--lang=\"fr\"".to_string()));
        assert!(argv.contains(&"--threads=\"4\"".to_string()));
    }

    #[test]
    fn compute_flags_without_equals() {
        let f = flags(&[("threads", json!(4))]);
        let argv = compute_flags(&f, false);
        assert_eq!(argv, vec!["--threads".to_string(), "4".to_string()]);
    }

    #[test]
    fn mount_points_match_table() {
        assert_eq!(mount_point_for("phet"), "/phet/dist");
        assert_eq!(mount_point_for("sotoki"), "/work");
        assert_eq!(mount_point_for("mwoffliner"), "/output");
    }

    #[test]
    fn zimit_shm_is_max_of_config_and_rule_then_clamped_to_memory() {
        let mut cfg = TaskConfig {
            task_name: "zimit".into(),
            image: crate::model::ImageRef {
                name: "openzim/zimit".into(),
                tag: "latest".into(),
            },
            flags: Map::new(),
            resources: ResourceSpec {
                cpu: 1,
                memory: 512 * 1024 * 1024,
                disk: 0,
                shm: Some(10 * 1024 * 1024),
            },
            warehouse_path: String::new(),
            queue: String::new(),
            command_information: None,
        };
        expanded_config(&mut cfg);
        // offliner rule wants 1 GiB shm, larger than both config's 10MiB and
        // the 512MiB memory cap, so it clamps to memory.
        assert_eq!(cfg.resources.shm, Some(512 * 1024 * 1024));
        assert_eq!(
            cfg.command_information.unwrap().cap_add,
            vec!["SYS_ADMIN".to_string(), "NET_ADMIN".to_string()]
        );
    }

    #[test]
    fn mwoffliner_has_no_cap_add() {
        let mut cfg = TaskConfig {
            task_name: "mwoffliner".into(),
            image: crate::model::ImageRef {
                name: "openzim/mwoffliner".into(),
                tag: "latest".into(),
            },
            flags: Map::new(),
            resources: ResourceSpec {
                cpu: 1,
                memory: 512 * 1024 * 1024,
                disk: 0,
                shm: None,
            },
            warehouse_path: String::new(),
            queue: String::new(),
            command_information: None,
        };
        expanded_config(&mut cfg);
        assert!(cfg.command_information.unwrap().cap_add.is_empty());
    }

    #[test]
    fn command_is_pure() {
        let f = flags(&[("output", json!("x"))]);
        let a = command_for("youtube", &f, "/output");
        let b = command_for("youtube", &f, "/output");
        assert_eq!(a, b);
    }
}
