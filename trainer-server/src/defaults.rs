use std::time::Duration;

pub const PLANNER_TICK_INTERVAL: Duration = Duration::from_secs(10);

pub const CHANGE_DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);
pub const CHANGE_SPAWN_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEAD_HOST_TIMEOUT: Duration = Duration::from_secs(120);

pub const SPOT_FAILURE_THRESHOLD: u32 = 3;
pub const SPOT_FAILURE_WINDOW: Duration = Duration::from_secs(1800);

pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
pub const AUDIT_CAPACITY: usize = 4096;
