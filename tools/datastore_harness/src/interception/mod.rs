//! Decorators that sit between code under test and the datastore, at the
//! RPC level (`Delegate`) or the service API level (`DatastoreService`).

pub mod batch_recorder;
pub mod colliding;
pub mod recording;
pub mod service_interceptor;
pub mod write_blocker;

pub use batch_recorder::{multi_put, named, BatchPredicate, BatchRecorder};
pub use colliding::{
    AlwaysCollide, CollideAfter, CollideTimes, CollidingUpdateDatastoreDelegate,
    CollisionPolicy, ExceptionPolicy,
};
pub use recording::{CallOutcome, CallRecord, RecordingDatastoreService};
pub use service_interceptor::{Interception, ServiceInterceptor, ServicePolicy};
pub use write_blocker::{with_writes_blocked, WriteBlocker};
