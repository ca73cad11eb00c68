use uuid::Uuid;

/// Record the outcome of a conditional status write.
///
/// `applied = false` means the compare-and-set matched no row: someone else
/// already moved the state, which is expected under concurrent writers.
pub fn log_transition(
    entity: &str,
    id: Uuid,
    from: &str,
    to: &str,
    reason: &str,
    applied: bool,
) {
    if applied {
        tracing::info!(
            entity,
            %id,
            from,
            to,
            reason,
            "[state_machine] {} {}: {} -> {}",
            entity,
            id,
            from,
            to
        );
    } else {
        tracing::debug!(
            entity,
            %id,
            from,
            to,
            reason,
            "[state_machine] {} {}: {} -> {} not applied (state moved concurrently)",
            entity,
            id,
            from,
            to
        );
    }
}

/// Render the accepted from-states of a conditional write, e.g. `pending|provisioning`.
pub fn any_of<S>(statuses: &[S], label: impl Fn(&S) -> &'static str) -> String {
    statuses.iter().map(label).collect::<Vec<_>>().join("|")
}

/// Quick log for callbacks that were acknowledged but deliberately not applied.
pub fn log_ignored(job_id: Uuid, current: &str, message: &str, why: &str) {
    tracing::warn!(
        %job_id,
        current,
        message,
        "[webhook] ignoring {} for job {} in status {}: {}",
        message,
        job_id,
        current,
        why
    );
}
