//! Product custom-resource watcher.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    discovery::Discovery,
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use keel_core::{InstanceId, ProductKind};

use crate::cluster::{find_api_resource, product_gvk};
use crate::render::strip_noisy;

/// Change to a product resource, as seen by the watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductEvent {
    /// Full manifest (cluster noise stripped); the document is parsed downstream.
    Applied(Json),
    Deleted(ProductKind, InstanceId),
}

fn instance_of(obj: &DynamicObject) -> Result<InstanceId> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let ns = obj.metadata.namespace.clone().unwrap_or_else(|| "default".into());
    Ok(InstanceId::new(ns, name))
}

fn applied(obj: &DynamicObject) -> Result<ProductEvent> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    Ok(ProductEvent::Applied(strip_noisy(raw)))
}

/// List+watch one product kind and forward events until the stream or receiver ends.
pub async fn watch_products(kind: ProductKind, namespace: Option<&str>, tx: mpsc::Sender<ProductEvent>) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = product_gvk(kind);
    let discovery = Discovery::new(client.clone()).run().await?;
    let (ar, _) = find_api_resource(&discovery, &gvk)
        .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))?;
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(product = %kind, ns = ?namespace, "product watcher started");
    while let Some(ev) = stream.try_next().await? {
        let events = match ev {
            Event::Applied(o) => vec![applied(&o)?],
            Event::Deleted(o) => vec![ProductEvent::Deleted(kind, instance_of(&o)?)],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().map(applied).collect::<Result<Vec<_>>>()?
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                debug!(product = %kind, "event receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(product = %kind, "watcher stream ended");
    Ok(())
}
