//! 容器 → 服务聚合
//! 纯函数：相同的容器输入总是得到相同的服务

use std::collections::{BTreeMap, BTreeSet};

use crate::scan::compose::ComposeStack;
use crate::scan::container::*;
use crate::scan::snapshot::Service;
use crate::utils::Criticality;

/// Group key: compose service label, else `<project>-<name>`, else container name.
pub fn service_key(c: &Container) -> String {
    if let Some(svc) = c.compose_service.as_deref().filter(|s| !s.is_empty()) {
        return svc.to_string();
    }
    match c.compose_project.as_deref().filter(|p| !p.is_empty()) {
        Some(project) => format!("{}-{}", project, c.name),
        None => c.name.clone(),
    }
}

/// Containers of one host keyed by service, each group sorted by name then id.
pub fn group_containers(containers: &[Container]) -> BTreeMap<String, Vec<Container>> {
    let mut groups: BTreeMap<String, Vec<Container>> = BTreeMap::new();
    for c in containers {
        groups.entry(service_key(c)).or_default().push(c.clone());
    }
    for members in groups.values_mut() {
        members.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    }
    groups
}

/// Build the fleet's services from per-host container lists and the compose
/// stacks found on those hosts. Each service is named `<key>@<host>`, so its
/// name never depends on what the other hosts report.
pub fn derive_services(
    containers_by_host: &BTreeMap<String, Vec<Container>>,
    stacks: &[ComposeStack],
) -> Vec<Service> {
    let mut services = Vec::new();
    for (host, containers) in containers_by_host {
        let host_stacks: Vec<&ComposeStack> = stacks.iter().filter(|s| s.host == *host).collect();
        let mut built: Vec<Service> = group_containers(containers)
            .into_iter()
            .map(|(key, members)| build_service(&key, host, members, &host_stacks))
            .collect();
        link_required_by(&mut built);
        services.extend(built);
    }

    services.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.host.cmp(&b.host)));
    services
}

fn build_service(key: &str, host: &str, containers: Vec<Container>, stacks: &[&ComposeStack]) -> Service {
    let compose_stack = containers.iter().find_map(|c| c.compose_project.clone());
    let compose_service = containers.iter().find_map(|c| c.compose_service.clone());

    let stack = compose_stack
        .as_deref()
        .and_then(|project| stacks.iter().copied().find(|s| s.name == project))
        .or_else(|| {
            let svc = compose_service.as_deref()?;
            let mut declaring = stacks.iter().copied().filter(|s| s.declares(svc));
            let first = declaring.next()?;
            // ambiguous when several stacks declare the same service name
            declaring.next().is_none().then_some(first)
        });

    let mut depends_on: BTreeSet<String> = containers
        .iter()
        .filter_map(|c| c.labels.get(COMPOSE_DEPENDS_ON_LABEL))
        .flat_map(|v| parse_depends_on_label(v))
        .collect();
    if let (Some(stack), Some(svc)) = (stack, compose_service.as_deref()) {
        if let Some(deps) = stack.depends_on.get(svc) {
            depends_on.extend(deps.iter().cloned());
        }
    }

    let mut ports: Vec<PortBinding> = containers.iter().flat_map(|c| c.ports.iter().cloned()).collect();
    ports.sort();
    ports.dedup();

    let image = containers.first().map(|c| c.image.clone()).filter(|i| !i.is_empty());
    let version = containers
        .iter()
        .find_map(|c| c.labels.get(OCI_VERSION_LABEL).filter(|v| !v.is_empty()).cloned())
        .or_else(|| image.as_deref().and_then(image_tag));

    Service {
        name: Service::qualified_name(key, host),
        host: host.to_string(),
        criticality: resolve_criticality(&containers),
        url: resolve_url(&containers),
        compose_stack: compose_stack.or_else(|| stack.map(|s| s.name.clone())),
        compose_file: stack.map(|s| s.path.clone()),
        image,
        version,
        ports,
        depends_on: depends_on.into_iter().collect(),
        required_by: Vec::new(),
        containers,
    }
}

/// Reverse `depends_on` over the services of one host.
fn link_required_by(services: &mut [Service]) {
    let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for svc in services.iter() {
        for dep in &svc.depends_on {
            reverse.entry(dep.clone()).or_default().insert(svc.key().to_string());
        }
    }
    for svc in services.iter_mut() {
        let key = svc.key().to_string();
        svc.required_by = reverse.remove(&key).map(|s| s.into_iter().collect()).unwrap_or_default();
    }
}

// ── 标签解析 ────────────────────────────────────────────────────────────────

/// First valid criticality label over the (name-sorted) containers.
pub fn resolve_criticality(containers: &[Container]) -> Criticality {
    containers
        .iter()
        .filter_map(|c| c.labels.get(CRITICALITY_LABEL))
        .find_map(|v| Criticality::parse(v))
        .unwrap_or_default()
}

/// `https://<host>` from the first traefik router rule carrying ``Host(`x`)``.
pub fn resolve_url(containers: &[Container]) -> Option<String> {
    containers.iter().find_map(|c| {
        c.labels
            .iter()
            .filter(|(k, _)| k.starts_with("traefik.http.routers.") && k.ends_with(".rule"))
            .find_map(|(_, rule)| traefik_host(rule))
            .map(|h| format!("https://{}", h))
    })
}

fn traefik_host(rule: &str) -> Option<&str> {
    let start = rule.find("Host(`")? + "Host(`".len();
    let len = rule[start..].find('`')?;
    (len > 0).then(|| &rule[start..start + len])
}

/// `db:service_started:false,redis:service_healthy:true` -> [db, redis]
fn parse_depends_on_label(v: &str) -> Vec<String> {
    v.split(',')
        .filter_map(|entry| entry.split(':').next())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tag part of an image reference; none for untagged or digest-only images.
pub fn image_tag(image: &str) -> Option<String> {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag.to_string())
        .filter(|t| !t.is_empty())
}
