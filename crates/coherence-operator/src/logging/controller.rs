//! Reporting of controller outcomes.
//!
//! The entry point is [`report_controller_reconciled`], meant to be run on every item of the
//! stream returned by [`kube::runtime::Controller::run`].

use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use super::k8s_events::publish_controller_error_as_k8s_event;

/// [`Error`] extensions for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name of the error, used as the reason of the published event.
    ///
    /// Usually implemented with [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// The related object the error happened on, if any, such as the StatefulSet of a cluster.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Logs the result of a reconciliation and publishes failures as Kubernetes events on the
/// reconciled object.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    client: &kube::Client,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn Error,
                "Failed to reconcile object",
            );
            publish_controller_error_as_k8s_event(client, controller_name, err);
        }
    }
}
