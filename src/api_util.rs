use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, PersistentVolume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::warn;

use crate::error::{classify_api_error, is_benign, ApiOutcome, ProvisionerError, Result};

/// Bounded retry count for the taint-removal patch's optimistic-concurrency loop.
const MAX_TAINT_REMOVAL_ATTEMPTS: u32 = 5;

/// Façade over the pieces of the cluster API the controller touches. Every write goes through
/// here so error classification (benign vs transient vs fatal) happens in one place instead of
/// being repeated at every call site.
pub struct ApiUtil {
    client: Client,
    namespace: String,
}

impl ApiUtil {
    pub fn new(client: Client, namespace: String) -> Self {
        ApiUtil { client, namespace }
    }

    fn pvs(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Creates a PV. A 409 Conflict is treated as success: it means a previous attempt already
    /// got the write through and this call is only racing its own retry.
    pub async fn create_pv(&self, pv: PersistentVolume) -> Result<()> {
        match self.pvs().create(&PostParams::default(), &pv).await {
            Ok(_) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Deletes a PV by name. A 404 NotFound is success: the desired end state, "this PV does not
    /// exist", already holds.
    pub async fn delete_pv(&self, name: &str) -> Result<()> {
        match self.pvs().delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    pub async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        match self.pvs().get(name).await {
            Ok(pv) => Ok(Some(pv)),
            Err(e) if classify_api_error(&e) == ApiOutcome::NotFound => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Records a Warning or Normal event against the given PV, following the usual
    /// `involvedObject` + `reportingComponent` event shape.
    pub async fn emit_event(
        &self,
        pv: &PersistentVolume,
        reason: &str,
        message: &str,
        reporting_component: &str,
        is_warning: bool,
    ) -> Result<()> {
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", pv.name_any())),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("PersistentVolume".to_string()),
                name: Some(pv.name_any()),
                uid: pv.uid(),
                api_version: Some("v1".to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(if is_warning { "Warning" } else { "Normal" }.to_string()),
            source: Some(EventSource {
                component: Some(reporting_component.to_string()),
                ..Default::default()
            }),
            count: Some(1),
            ..Default::default()
        };

        match self.events().create(&PostParams::default(), &event).await {
            Ok(_) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Removes `taint_key` from the node's taint list via a JSON merge patch. A no-op (and
    /// success) if the taint is already gone. A 409 Conflict means the patch lost a race against
    /// another writer, not that the taint was removed, so it refetches the node and retries
    /// rather than treating the conflict as success.
    pub async fn remove_node_taint(&self, node_name: &str, taint_key: &str) -> Result<()> {
        let mut last_conflict = None;
        for attempt in 1..=MAX_TAINT_REMOVAL_ATTEMPTS {
            let node = match self.nodes().get(node_name).await {
                Ok(n) => n,
                Err(e) if classify_api_error(&e) == ApiOutcome::NotFound => return Ok(()),
                Err(e) => return Err(map_err(e)),
            };

            let had_taint = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.as_ref())
                .map(|t| t.iter().any(|t| t.key == taint_key))
                .unwrap_or(false);
            if !had_taint {
                return Ok(());
            }

            let remaining: Vec<_> = node
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|t| t.key != taint_key)
                .collect();

            let patch = serde_json::json!({ "spec": { "taints": remaining } });
            match self
                .nodes()
                .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if classify_api_error(&e) == ApiOutcome::NotFound => return Ok(()),
                Err(e) if classify_api_error(&e) == ApiOutcome::Conflict => {
                    warn!(node = node_name, attempt, "taint removal patch conflicted, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(map_err(e)),
            }
        }
        Err(map_err(
            last_conflict.expect("loop only exits here after recording a conflict"),
        ))
    }

    /// Fetches the node this process runs on, used to read its UID for the provisioner identity
    /// and to check readiness before the controller starts reconciling.
    pub async fn get_node(&self, node_name: &str) -> Result<Node> {
        self.nodes().get(node_name).await.map_err(map_err)
    }
}

fn map_err(e: kube::Error) -> ProvisionerError {
    match classify_api_error(&e) {
        ApiOutcome::Fatal => ProvisionerError::FatalConfig(format!("cluster API rejected request: {e}")),
        _ => ProvisionerError::TransientApi(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Boom".to_string(),
            code,
        })
    }

    #[test]
    fn map_err_surfaces_fatal_config_for_unclassified_4xx() {
        let err = map_err(api_error(400));
        assert!(matches!(err, ProvisionerError::FatalConfig(_)));
    }

    #[test]
    fn map_err_surfaces_transient_api_for_5xx() {
        let err = map_err(api_error(503));
        assert!(matches!(err, ProvisionerError::TransientApi(_)));
    }

    #[test]
    fn map_err_surfaces_transient_api_for_conflict_and_not_found() {
        assert!(matches!(
            map_err(api_error(409)),
            ProvisionerError::TransientApi(_)
        ));
        assert!(matches!(
            map_err(api_error(404)),
            ProvisionerError::TransientApi(_)
        ));
    }
}
