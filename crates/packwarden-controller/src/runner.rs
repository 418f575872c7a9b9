//! Drives the controllers from Kubernetes watches

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::crd::{ModulePullOverride, ModuleRelease, ModuleSource};
use crate::error::{ControllerError, Result};
use crate::pulloverride::PullOverrideController;
use crate::release::ReleaseController;
use crate::source::SourceController;
use crate::store::CustomObject;

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// A controller reconciling one kind by object name
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: CustomObject;

    fn name(&self) -> &'static str;

    async fn reconcile(&self, name: &str) -> Result<Action>;
}

#[async_trait]
impl Reconciler for ReleaseController {
    type Object = ModuleRelease;

    fn name(&self) -> &'static str {
        "release"
    }

    async fn reconcile(&self, name: &str) -> Result<Action> {
        ReleaseController::reconcile(self, name).await
    }
}

#[async_trait]
impl Reconciler for SourceController {
    type Object = ModuleSource;

    fn name(&self) -> &'static str {
        "source"
    }

    async fn reconcile(&self, name: &str) -> Result<Action> {
        SourceController::reconcile(self, name).await
    }
}

#[async_trait]
impl Reconciler for PullOverrideController {
    type Object = ModulePullOverride;

    fn name(&self) -> &'static str {
        "pull-override"
    }

    async fn reconcile(&self, name: &str) -> Result<Action> {
        PullOverrideController::reconcile(self, name).await
    }
}

async fn reconcile<R: Reconciler>(
    obj: Arc<R::Object>,
    reconciler: Arc<R>,
) -> std::result::Result<Action, ControllerError> {
    reconciler.reconcile(&obj.name_any()).await
}

fn error_policy<R: Reconciler>(
    obj: Arc<R::Object>,
    error: &ControllerError,
    reconciler: Arc<R>,
) -> Action {
    tracing::warn!(
        controller = reconciler.name(),
        object = %obj.name_any(),
        error = %error,
        "reconcile failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Run one controller until the token is cancelled
pub async fn run<R: Reconciler>(client: Client, reconciler: Arc<R>, cancel: CancellationToken) {
    let api: Api<R::Object> = Api::all(client);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let trigger = tokio::spawn(async move {
        cancel.cancelled().await;
        let _ = stop_tx.send(());
    });

    let span = tracing::info_span!("controller", name = reconciler.name());
    async move {
        tracing::info!("controller started");
        Controller::new(api, watcher::Config::default())
            .graceful_shutdown_on(async move {
                let _ = stop_rx.await;
            })
            .run(reconcile::<R>, error_policy::<R>, reconciler)
            .for_each(|result| async move {
                match result {
                    Ok((object, _)) => tracing::debug!(object = %object.name, "reconciled"),
                    Err(e) => tracing::debug!(error = %e, "controller event failed"),
                }
            })
            .await;
        tracing::info!("controller stopped");
    }
    .instrument(span)
    .await;

    trigger.abort();
}

/// The three module controllers sharing one client
pub struct Controllers {
    pub releases: Arc<ReleaseController>,
    pub sources: Arc<SourceController>,
    pub overrides: Arc<PullOverrideController>,
}

impl Controllers {
    /// Spawn every controller; the returned set finishes after cancellation
    pub fn spawn(self, client: Client, cancel: &CancellationToken) -> JoinSet<()> {
        let mut set = JoinSet::new();
        set.spawn(run(client.clone(), self.releases, cancel.clone()));
        set.spawn(run(client.clone(), self.sources, cancel.clone()));
        set.spawn(run(client, self.overrides, cancel.clone()));
        set
    }
}
