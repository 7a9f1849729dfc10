//! Protocol limits, enforced on the host side.

use std::time::Duration;

/// Largest single message accepted on a connection. A longer line is a
/// protocol violation, not silently truncated.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Largest amount of unconsumed data buffered per connection. Output that
/// drips in without a line terminator is bounded by this cap.
pub const MAX_BUFFERED_BYTES: usize = 10 * 1024 * 1024;

/// Wall-clock deadline for one execute call. No response by then is a
/// timeout failure and the connection is marked dead.
pub const EXECUTE_DEADLINE: Duration = Duration::from_secs(300);

/// Deadline for control messages (reset / ping / context seeding), which
/// never run user code and should answer quickly.
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(10);
