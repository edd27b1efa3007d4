use crate::constants::stack as stack_constants;
use crate::errors::{Error, Result};
use crate::services::compose::{ServiceOptions, StackFile};
use crate::services::engine::{validate_name, ServiceApi, ServiceDefinition, ServiceRef};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Services sharing one namespace label. Recomputed on every query.
#[derive(Debug, Clone, Serialize)]
pub struct Stack {
    pub namespace: String,
    pub services: Vec<ServiceRef>,
}

impl Stack {
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|service| service.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackSummary {
    pub namespace: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub namespace: String,
    /// Every service created, in creation order.
    pub created: Vec<String>,
    /// Services that existed in the namespace and were recreated.
    pub replaced: Vec<String>,
    /// Options accepted but not applied, as `service.key` or a top-level section.
    pub dropped: Vec<String>,
}

/// Reconciles stacks against the engine's service list.
#[derive(Clone)]
pub struct StackModel {
    services: Arc<dyn ServiceApi>,
}

impl StackModel {
    pub fn new(services: Arc<dyn ServiceApi>) -> Self {
        Self { services }
    }

    /// Groups labelled services by namespace. Unlabelled services are skipped.
    pub async fn list(&self) -> Result<Vec<Stack>> {
        let mut grouped: BTreeMap<String, Vec<ServiceRef>> = BTreeMap::new();
        for service in self.services.list_services().await? {
            if let Some(namespace) = service.namespace() {
                grouped
                    .entry(namespace.to_string())
                    .or_default()
                    .push(service);
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(namespace, services)| Stack {
                namespace,
                services,
            })
            .collect())
    }

    pub async fn get(&self, namespace: &str) -> Result<Stack> {
        self.list()
            .await?
            .into_iter()
            .find(|stack| stack.namespace == namespace)
            .ok_or_else(|| Error::not_found(format!("could not find stack: {}", namespace)))
    }

    pub async fn list_stacks(&self) -> Result<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|stack| stack.namespace)
            .collect())
    }

    pub async fn get_stack(&self, namespace: &str) -> Result<StackSummary> {
        let stack = self.get(namespace).await?;
        Ok(StackSummary {
            services: stack.service_names(),
            namespace: stack.namespace,
        })
    }

    /// Creates one service per entry of `file` under `namespace`.
    ///
    /// A service already present in the namespace under the same name is
    /// removed and recreated. A same-named service that belongs elsewhere
    /// (another namespace or none) is a conflict and nothing is touched.
    /// The first failing engine call aborts the deploy; when earlier
    /// services were already applied the error is a partial failure
    /// listing them.
    pub async fn deploy(&self, namespace: &str, file: &StackFile) -> Result<DeployReport> {
        validate_name("stack", namespace)?;
        let mut report = DeployReport {
            namespace: namespace.to_string(),
            ..Default::default()
        };

        let mut definitions = Vec::with_capacity(file.services.len());
        for (name, options) in &file.services {
            validate_name("service", name)?;
            for key in options.dropped_keys() {
                tracing::warn!(stack = namespace, service = %name, key, "option not supported, dropped");
                report.dropped.push(format!("{}.{}", name, key));
            }
            definitions.push(definition(namespace, name, options)?);
        }
        for section in file.dropped_sections() {
            tracing::warn!(stack = namespace, section, "top-level section not supported, dropped");
            report.dropped.push(section.to_string());
        }

        let existing: HashMap<String, ServiceRef> = self
            .services
            .list_services()
            .await?
            .into_iter()
            .map(|service| (service.name.clone(), service))
            .collect();
        let mut plan = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let replace = match existing.get(&definition.name) {
                None => None,
                Some(service) if service.namespace() == Some(namespace) => {
                    Some(service.id.clone())
                }
                Some(service) => {
                    return Err(Error::conflict(format!(
                        "service '{}' already exists outside stack '{}' (namespace {})",
                        definition.name,
                        namespace,
                        service.namespace().unwrap_or("none")
                    )))
                }
            };
            plan.push((definition, replace));
        }

        for (definition, replace) in plan {
            let name = definition.name.clone();
            if let Some(id) = replace {
                if let Err(err) = self.services.remove_service(&id).await {
                    return Err(Error::partial(report.created, name, err));
                }
                tracing::info!(stack = namespace, service = %name, "removed for redeploy");
                report.replaced.push(name.clone());
            }
            match self.services.create_service(&definition).await {
                Ok(id) => {
                    tracing::info!(stack = namespace, service = %name, id = %id, "service created");
                    report.created.push(name);
                }
                Err(err) => {
                    // The old copy of a replaced service is already gone.
                    let removed = if report.replaced.last() == Some(&name) {
                        vec![name.clone()]
                    } else {
                        Vec::new()
                    };
                    tracing::error!(stack = namespace, service = %name, error = %err, "deploy aborted");
                    return Err(Error::partial_with_removed(report.created, removed, name, err));
                }
            }
        }
        Ok(report)
    }

    /// Removes every service of the stack, stopping at the first failure.
    /// Returns the removed service names.
    pub async fn remove(&self, namespace: &str) -> Result<Vec<String>> {
        let stack = self.get(namespace).await?;
        let mut removed = Vec::with_capacity(stack.services.len());
        for service in stack.services {
            if let Err(err) = self.services.remove_service(&service.id).await {
                return Err(Error::partial(removed, service.name, err));
            }
            tracing::info!(stack = namespace, service = %service.name, "service removed");
            removed.push(service.name);
        }
        Ok(removed)
    }
}

fn definition(namespace: &str, name: &str, options: &ServiceOptions) -> Result<ServiceDefinition> {
    let mut labels = options
        .labels
        .as_ref()
        .map(|labels| labels.to_map())
        .unwrap_or_default();
    labels.insert(
        stack_constants::NAMESPACE_LABEL.to_string(),
        namespace.to_string(),
    );
    Ok(ServiceDefinition {
        name: name.to_string(),
        image: options.image.clone(),
        command: options.entrypoint.as_ref().map(|line| line.to_argv()).transpose()?,
        args: options.command.as_ref().map(|line| line.to_argv()).transpose()?,
        env: options
            .environment
            .as_ref()
            .map(|env| env.to_entries())
            .unwrap_or_default(),
        labels,
        hostname: options.hostname.clone(),
        user: options.user.clone(),
        working_dir: options.working_dir.clone(),
        networks: options
            .networks
            .as_ref()
            .map(|networks| networks.names())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_carries_namespace_label_over_user_labels() {
        let file = StackFile::parse(
            "services:\n  web:\n    image: nginx\n    entrypoint: [\"/bin/sh\", \"-c\"]\n    command: echo hi\n    labels:\n      com.docker.stack.namespace: other\n      tier: front\n",
        )
        .expect("stack file");
        let definition = definition("a", "web", &file.services["web"]).expect("definition");
        assert_eq!(definition.name, "web");
        assert_eq!(definition.labels[stack_constants::NAMESPACE_LABEL], "a");
        assert_eq!(definition.labels["tier"], "front");
        assert_eq!(
            definition.command,
            Some(vec!["/bin/sh".to_string(), "-c".to_string()])
        );
        assert_eq!(
            definition.args,
            Some(vec!["echo".to_string(), "hi".to_string()])
        );
    }
}
