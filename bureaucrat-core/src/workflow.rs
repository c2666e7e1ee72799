use crate::flow::{FlowTree, NodeSnapshot};
use crate::storage::{Storage, BUCKET_DEFINITION, BUCKET_PROCESS};
use crate::xml::XmlElement;
use anyhow::{Context as _, Result};
use std::sync::Arc;

/// Per-instance facade: builds the flow tree from the stored XML definition
/// and snapshots it back after every handled message. Definition + snapshot
/// together fully reconstruct an instance; nothing lives only in memory.
pub struct Workflow {
    pub process: FlowTree,
}

impl Workflow {
    /// Create a new instance: store the definition under `pid`, build the
    /// tree and persist the initial (all-ready) snapshot.
    pub async fn create_from_string(
        storage: &Arc<dyn Storage>,
        pdef: &str,
        pid: &str,
    ) -> Result<Self> {
        tracing::debug!(pid, "creating workflow instance");
        let root = XmlElement::parse(pdef)?;
        let process = FlowTree::build(&root, pid)?;
        let workflow = Workflow { process };

        let _guard = storage.lock().await?;
        storage
            .save(BUCKET_DEFINITION, pid, pdef.as_bytes())
            .await?;
        write_snapshot(storage, &workflow).await?;
        Ok(workflow)
    }

    /// Reconstruct an instance from its stored definition and snapshot.
    pub async fn load(storage: &Arc<dyn Storage>, pid: &str) -> Result<Self> {
        let _guard = storage.lock().await?;
        let pdef = storage
            .load(BUCKET_DEFINITION, pid)
            .await
            .with_context(|| format!("no definition for instance {pid}"))?;
        let root = XmlElement::parse(std::str::from_utf8(&pdef)?)?;
        let mut process = FlowTree::build(&root, pid)?;

        let snapshot_doc = storage
            .load(BUCKET_PROCESS, pid)
            .await
            .with_context(|| format!("no snapshot for instance {pid}"))?;
        let snapshot: NodeSnapshot = serde_json::from_slice(&snapshot_doc)?;
        process.restore(&snapshot)?;
        Ok(Workflow { process })
    }

    /// Persist the current snapshot.
    pub async fn save(&self, storage: &Arc<dyn Storage>) -> Result<()> {
        let _guard = storage.lock().await?;
        write_snapshot(storage, self).await
    }

    /// Remove both instance documents.
    pub async fn delete(storage: &Arc<dyn Storage>, pid: &str) -> Result<()> {
        let _guard = storage.lock().await?;
        storage.delete(BUCKET_DEFINITION, pid).await?;
        storage.delete(BUCKET_PROCESS, pid).await
    }
}

async fn write_snapshot(storage: &Arc<dyn Storage>, workflow: &Workflow) -> Result<()> {
    let snapshot = serde_json::to_vec(&workflow.process.snapshot())?;
    storage
        .save(BUCKET_PROCESS, workflow.process.pid(), &snapshot)
        .await
}
