//! Publishing reconciliation errors as Kubernetes events.

use std::{error::Error, fmt::Write as _};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder, Reporter},
};
use tracing::Instrument;

use super::controller::ReconcilerError;

/// Longest event note accepted by the API server, in bytes.
const MAX_NOTE_LEN: usize = 1024;

/// The error and its whole source chain as one Warning event.
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    let mut note = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        let _ = write!(note, ": {err}");
        source = err.source();
    }
    truncate_with_ellipsis(&mut note, MAX_NOTE_LEN);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_owned(),
        note: Some(note),
        action: "Reconcile".to_owned(),
        secondary: err.secondary_object().map(Into::into),
    }
}

/// Publishes the reconciler error in `controller_error` on the object it failed for.
///
/// Errors of the controller machinery itself are not tied to an object and are only logged.
#[tracing::instrument(skip(client, controller_error))]
pub fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    client: &kube::Client,
    controller: &str,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    let controller::Error::ReconcilerFailed(error, obj) = controller_error else {
        return;
    };
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: controller.to_owned(),
            instance: None,
        },
    );
    let event = error_to_event(error);
    let reference: ObjectReference = obj.clone().into();
    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &err as &dyn Error,
                    "failed to report error as Kubernetes event"
                );
            }
        }
        .in_current_span(),
    );
}

/// Shortens `msg` to at most `max_len` bytes, marking the cut with an ellipsis.
fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
    const ELLIPSIS: char = '…';
    if msg.len() <= max_len {
        return;
    }
    let mut cut = max_len.saturating_sub(ELLIPSIS.len_utf8());
    while !msg.is_char_boundary(cut) {
        cut -= 1;
    }
    msg.truncate(cut);
    if ELLIPSIS.len_utf8() <= max_len {
        msg.push(ELLIPSIS);
    }
}
