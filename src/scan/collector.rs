//! 容器信息收集
//! 来源：`docker ps -aq`，再对全部 id 执行一次 `docker inspect`

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::scan::channel::ExecChannel;
use crate::scan::container::*;
use crate::scan::probe::{salvage_stdout, Partial, ProbeError, ProbeResult};

const LIST_COMMAND: &str = "docker ps -aq --no-trunc";
const DOCKER_ZERO_TIME: &str = "0001-01-01T00:00:00Z";

// ── 公开接口 ────────────────────────────────────────────────────────────────

pub async fn probe(channel: &dyn ExecChannel, deadline: Duration) -> ProbeResult<Vec<Container>> {
    let ids = list_container_ids(channel, deadline).await?;
    if ids.is_empty() {
        return Ok(Partial::new(Vec::new()));
    }

    // a container removed after `docker ps` fails the call but not the others
    let command = inspect_command(&ids);
    let mut warnings = Vec::new();
    let raw = salvage_stdout(channel.exec(&command, deadline).await, &mut warnings)?;
    let mut parsed = parse_inspect_output(&raw)?;
    warnings.append(&mut parsed.warnings);
    parsed.warnings = warnings;
    Ok(parsed)
}

pub fn inspect_command(ids: &[String]) -> String {
    let mut parts = vec!["docker".to_string(), "inspect".to_string()];
    parts.extend(ids.iter().cloned());
    shell_words::join(parts)
}

// ── docker ps ───────────────────────────────────────────────────────────────

async fn list_container_ids(channel: &dyn ExecChannel, deadline: Duration) -> Result<Vec<String>, ProbeError> {
    let out = channel.exec(LIST_COMMAND, deadline).await?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

// ── docker inspect ──────────────────────────────────────────────────────────

/// Fatal only when the whole document is unusable; single entries degrade.
pub fn parse_inspect_output(raw: &str) -> ProbeResult<Vec<Container>> {
    let doc: Value = serde_json::from_str(raw)
        .map_err(|e| ProbeError::Unparseable(format!("docker inspect JSON: {}", e)))?;
    let entries = doc
        .as_array()
        .ok_or_else(|| ProbeError::Unparseable("docker inspect did not return an array".to_string()))?;

    let mut result = Partial::new(Vec::with_capacity(entries.len()));
    for (i, entry) in entries.iter().enumerate() {
        if !entry.is_object() {
            result.warn(format!("inspect entry {} is not an object, skipped", i));
            continue;
        }
        match parse_inspect(entry) {
            Some(parsed) => {
                result.warnings.extend(parsed.warnings);
                result.value.push(parsed.value);
            }
            None => result.warn(format!("inspect entry {} has neither Id nor Name, skipped", i)),
        }
    }
    Ok(result)
}

fn parse_inspect(c: &Value) -> Option<Partial<Container>> {
    let mut warnings = Vec::new();

    let raw_id = c["Id"].as_str().unwrap_or("");
    let raw_name = c["Name"].as_str().unwrap_or("").trim_start_matches('/');
    if raw_id.is_empty() && raw_name.is_empty() {
        return None;
    }
    let short_id: String = raw_id.chars().take(12).collect();
    let label = if raw_name.is_empty() { short_id.clone() } else { raw_name.to_string() };

    let id = if raw_id.is_empty() {
        warnings.push(format!("container {}: missing Id", label));
        "unknown".to_string()
    } else {
        raw_id.to_string()
    };
    let name = if raw_name.is_empty() {
        warnings.push(format!("container {}: missing Name, using short id", short_id));
        short_id
    } else {
        raw_name.to_string()
    };

    let image = match str_val(c, &["Config", "Image"]) {
        Some(img) => img,
        None => {
            warnings.push(format!("container {}: missing Config.Image", name));
            "unknown".to_string()
        }
    };

    let status = str_val(c, &["State", "Status"]).unwrap_or_else(|| {
        warnings.push(format!("container {}: missing State.Status", name));
        "unknown".to_string()
    });
    let state = ContainerState::from_docker(&status);

    let labels = parse_labels(c);
    let compose_project = labels.get(COMPOSE_PROJECT_LABEL).cloned();
    let compose_service = labels.get(COMPOSE_SERVICE_LABEL).cloned();

    let created = parse_time(c, &["Created"], &name, &mut warnings);
    let started = parse_time(c, &["State", "StartedAt"], &name, &mut warnings);

    let ports = parse_ports(c, &name, &mut warnings);

    Some(Partial {
        value: Container {
            id,
            name,
            image,
            state,
            status,
            ports,
            labels,
            mounts: parse_mounts(c),
            networks: parse_networks(c),
            restart_policy: str_val(c, &["HostConfig", "RestartPolicy", "Name"]).filter(|p| !p.is_empty()),
            restart_count: c["RestartCount"].as_u64().unwrap_or(0),
            created,
            started,
            health: str_val(c, &["State", "Health", "Status"]),
            compose_project,
            compose_service,
        },
        warnings,
    })
}

fn parse_labels(c: &Value) -> BTreeMap<String, String> {
    c["Config"]["Labels"]
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Published ports; stopped containers only keep them under HostConfig.
fn parse_ports(c: &Value, name: &str, warnings: &mut Vec<String>) -> Vec<PortBinding> {
    let source = match c["NetworkSettings"]["Ports"].as_object() {
        Some(p) if !p.is_empty() => p,
        _ => match c["HostConfig"]["PortBindings"].as_object() {
            Some(p) => p,
            None => return Vec::new(),
        },
    };

    let mut ports = Vec::new();
    for (container_port, bindings) in source {
        let (port, proto) = container_port
            .split_once('/')
            .unwrap_or((container_port.as_str(), "tcp"));
        let container_port: u16 = match port.parse() {
            Ok(p) => p,
            Err(_) => {
                warnings.push(format!("container {}: bad port key {:?}", name, container_port));
                continue;
            }
        };

        if let Some(arr) = bindings.as_array() {
            for b in arr {
                let host_port = b["HostPort"].as_str().and_then(|s| s.parse().ok());
                ports.push(PortBinding {
                    container_port,
                    host_port,
                    protocol: proto.to_string(),
                    host_ip: b["HostIp"].as_str().filter(|s| !s.is_empty()).unwrap_or("0.0.0.0").to_string(),
                });
            }
        }
    }
    ports.sort();
    ports.dedup();
    ports
}

fn parse_mounts(c: &Value) -> Vec<MountInfo> {
    c["Mounts"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|m| MountInfo {
                    mount_type: m["Type"].as_str().unwrap_or("").to_string(),
                    source: m["Source"].as_str().or(m["Name"].as_str()).unwrap_or("").to_string(),
                    destination: m["Destination"].as_str().unwrap_or("").to_string(),
                    rw: m["RW"].as_bool().unwrap_or(false),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_networks(c: &Value) -> Vec<String> {
    let mut names: Vec<String> = c["NetworkSettings"]["Networks"]
        .as_object()
        .map(|n| n.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

fn parse_time(c: &Value, path: &[&str], name: &str, warnings: &mut Vec<String>) -> Option<DateTime<Utc>> {
    let raw = str_val(c, path)?;
    if raw.is_empty() || raw == DOCKER_ZERO_TIME {
        return None;
    }
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            warnings.push(format!("container {}: bad {} {:?}: {}", name, path.join("."), raw, e));
            None
        }
    }
}

// ── 工具 ────────────────────────────────────────────────────────────────────

fn str_val(c: &Value, path: &[&str]) -> Option<String> {
    let mut cur = c;
    for key in path {
        cur = &cur[key];
    }
    cur.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::channel::fake::ScriptedChannel;

    const INSPECT: &str = r#"[
      {
        "Id": "4f2a9c1e7b3d11112222333344445555",
        "Name": "/nextcloud-app-1",
        "Created": "2026-09-30T08:15:02.123456789Z",
        "RestartCount": 2,
        "State": {"Status": "running", "StartedAt": "2026-10-01T10:00:00Z", "Health": {"Status": "healthy"}},
        "Config": {
          "Image": "nextcloud:29.0.4",
          "Labels": {
            "com.docker.compose.project": "nextcloud",
            "com.docker.compose.service": "app",
            "homelab.criticality": "critical"
          }
        },
        "HostConfig": {"RestartPolicy": {"Name": "unless-stopped"}},
        "NetworkSettings": {
          "Ports": {
            "80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8080"}, {"HostIp": "::", "HostPort": "8080"}],
            "9000/tcp": null
          },
          "Networks": {"proxy": {}, "nextcloud_default": {}}
        },
        "Mounts": [{"Type": "volume", "Name": "nc_data", "Destination": "/var/www/html", "RW": true}]
      },
      {
        "Id": "9e9e9e9e9e9e0000",
        "Name": "/old-backup",
        "Created": "not-a-date",
        "State": {"Status": "exited", "StartedAt": "0001-01-01T00:00:00Z"},
        "Config": {"Image": "restic/restic"},
        "HostConfig": {"PortBindings": {"8000/tcp": [{"HostIp": "", "HostPort": "8000"}]}},
        "NetworkSettings": {"Ports": {}}
      },
      "junk"
    ]"#;

    #[test]
    fn parses_inspect_with_soft_failures() {
        let parsed = parse_inspect_output(INSPECT).unwrap();
        assert_eq!(parsed.value.len(), 2);

        let app = &parsed.value[0];
        assert_eq!(app.name, "nextcloud-app-1");
        assert_eq!(app.state, ContainerState::Running);
        assert_eq!(app.compose_project.as_deref(), Some("nextcloud"));
        assert_eq!(app.compose_service.as_deref(), Some("app"));
        assert_eq!(app.health.as_deref(), Some("healthy"));
        assert_eq!(app.restart_policy.as_deref(), Some("unless-stopped"));
        assert_eq!(app.restart_count, 2);
        assert_eq!(app.networks, vec!["nextcloud_default", "proxy"]);
        assert_eq!(app.ports.len(), 2);
        assert!(app.ports.iter().all(|p| p.container_port == 80 && p.host_port == Some(8080)));
        assert_eq!(app.mounts[0].source, "nc_data");
        assert!(app.created.is_some());

        let backup = &parsed.value[1];
        assert_eq!(backup.state, ContainerState::Stopped);
        assert_eq!(backup.started, None);
        assert_eq!(backup.created, None);
        assert_eq!(backup.ports[0].host_ip, "0.0.0.0");
        assert_eq!(backup.ports[0].host_port, Some(8000));

        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed.warnings.iter().any(|w| w.contains("old-backup") && w.contains("Created")));
        assert!(parsed.warnings.iter().any(|w| w.contains("entry 2")));
    }

    #[test]
    fn unparseable_document_is_fatal() {
        assert!(matches!(parse_inspect_output("Error: no such object"), Err(ProbeError::Unparseable(_))));
        assert!(matches!(parse_inspect_output("{}"), Err(ProbeError::Unparseable(_))));
    }

    #[tokio::test]
    async fn lists_then_inspects() {
        let ids = vec!["aaa".to_string(), "bbb".to_string()];
        let ch = ScriptedChannel::new()
            .ok(LIST_COMMAND, "aaa\nbbb\n")
            .ok(&inspect_command(&ids), r#"[{"Id":"aaa","Name":"/a","State":{"Status":"paused"},"Config":{"Image":"x"}},
                                              {"Id":"bbb","Name":"/b","State":{"Status":"dead"},"Config":{"Image":"y"}}]"#);
        let res = probe(&ch, Duration::from_secs(1)).await.unwrap();
        let states: Vec<_> = res.value.iter().map(|c| c.state).collect();
        assert_eq!(states, vec![ContainerState::Paused, ContainerState::Dead]);
        assert!(res.warnings.is_empty());
    }

    #[tokio::test]
    async fn empty_host_skips_inspect() {
        let ch = ScriptedChannel::new().ok(LIST_COMMAND, "\n");
        let res = probe(&ch, Duration::from_secs(1)).await.unwrap();
        assert!(res.value.is_empty());
        assert_eq!(ch.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn container_gone_before_inspect_keeps_the_rest() {
        let ch = ScriptedChannel::new().ok(LIST_COMMAND, "aaa\nbbb\n").on(
            "docker inspect aaa bbb",
            Err(ProbeError::Command {
                command: "docker inspect aaa bbb".into(),
                code: Some(1),
                stderr: "Error: No such object: bbb".into(),
                stdout: r#"[{"Id":"aaa","Name":"/a","State":{"Status":"running"},"Config":{"Image":"x:1"}}]"#.into(),
            }),
        );
        let res = probe(&ch, Duration::from_secs(1)).await.unwrap();
        assert_eq!(res.value.len(), 1);
        assert_eq!(res.value[0].name, "a");
        assert_eq!(res.warnings.len(), 1);
        assert!(res.warnings[0].contains("No such object: bbb"));
    }

    #[tokio::test]
    async fn inspect_failure_without_output_stays_fatal() {
        let ch = ScriptedChannel::new().ok(LIST_COMMAND, "aaa\n").on(
            "docker inspect aaa",
            Err(ProbeError::Command {
                command: "docker inspect aaa".into(),
                code: Some(1),
                stderr: "permission denied while trying to connect to the Docker daemon socket".into(),
                stdout: String::new(),
            }),
        );
        let err = probe(&ch, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Command { code: Some(1), .. }));
    }
}
