//! Stream names and system event types owned by a projection.

/// Event type of the events written to a projection's checkpoint stream.
pub const PROJECTION_CHECKPOINT_EVENT_TYPE: &str = "$ProjectionCheckpoint";

/// Event type of per-partition checkpoint events.
pub const PARTITION_CHECKPOINT_EVENT_TYPE: &str = "$Checkpoint";

/// Event type of stream metadata events.
pub const STREAM_METADATA_EVENT_TYPE: &str = "$metadata";

/// Event type of result events.
pub const RESULT_EVENT_TYPE: &str = "Result";

/// Event type written when a partition's result is cleared.
pub const RESULT_REMOVED_EVENT_TYPE: &str = "ResultRemoved";

/// Role allowed to read and write checkpoint streams.
pub const ADMINS_ROLE: &str = "$admins";

const PROJECTIONS_PREFIX: &str = "$projections-";

/// Derives the names of the system streams owned by one projection.
///
/// # Examples
///
/// ```
/// use eventfold_projections::ProjectionNames;
///
/// let names = ProjectionNames::new("order-totals");
/// assert_eq!(names.checkpoint_stream(), "$projections-order-totals-checkpoint");
/// assert_eq!(
///     names.partition_checkpoint_stream("order-7"),
///     "$projections-order-totals-order-7-checkpoint"
/// );
/// assert_eq!(ProjectionNames::metadata_stream("orders"), "$$orders");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionNames {
    name: String,
}

impl ProjectionNames {
    /// Create the name set for the projection called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The projection's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream holding the projection's checkpoints.
    pub fn checkpoint_stream(&self) -> String {
        format!("{PROJECTIONS_PREFIX}{}-checkpoint", self.name)
    }

    /// Stream holding checkpoints of one non-root partition.
    pub fn partition_checkpoint_stream(&self, partition: &str) -> String {
        format!("{PROJECTIONS_PREFIX}{}-{partition}-checkpoint", self.name)
    }

    /// Stream holding results of `partition`. The root partition (`""`)
    /// writes to the projection-wide result stream.
    pub fn result_stream(&self, partition: &str) -> String {
        if partition.is_empty() {
            format!("{PROJECTIONS_PREFIX}{}-result", self.name)
        } else {
            format!("{PROJECTIONS_PREFIX}{}-{partition}-result", self.name)
        }
    }

    /// Metadata stream of `stream`.
    pub fn metadata_stream(stream: &str) -> String {
        format!("$${stream}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_streams() {
        let names = ProjectionNames::new("counts");
        assert_eq!(names.result_stream(""), "$projections-counts-result");
        assert_eq!(names.result_stream("a"), "$projections-counts-a-result");
    }

    #[test]
    fn metadata_of_checkpoint_stream() {
        let names = ProjectionNames::new("counts");
        assert_eq!(
            ProjectionNames::metadata_stream(&names.checkpoint_stream()),
            "$$$projections-counts-checkpoint"
        );
    }
}
