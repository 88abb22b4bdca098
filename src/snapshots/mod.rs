mod volumesnapshotclass;

pub use volumesnapshotclass::{
    ensure_default_volume_snapshot_class, SnapshotClassError, DEFAULT_CLASS_ANNOTATION,
};
