// Process module - Spawning, termination, restart policy and resource sampling

pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod terminate;

pub use monitor::{ResourceMonitor, SystemSnapshot};
pub use restart::{RestartDecision, RestartPolicy, RestartPolicyEngine, RestartStatus};
pub use spawner::{spawn_process, SpawnConfig, SpawnedProcess};
pub use supervisor::ProcessSupervisor;
pub use terminate::{platform_terminator, ExitInfo, ExitWatch, Terminator};
