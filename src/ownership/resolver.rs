//! Deciding who drives a loop and claiming it for them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::link::DaemonLink;
use crate::domain::OwnerKind;
use crate::error::{LoopdError, Result};
use crate::id::now_ms;
use crate::recovery::Restarter;
use crate::store::Store;

/// Claim attempts before a conflict is reported.
const CLAIM_ATTEMPTS: u32 = 3;
const CLAIM_BACKOFF: Duration = Duration::from_millis(50);

/// Requested ownership mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnOwner {
    /// Run in the calling process
    #[default]
    Local,
    /// Hand to the daemon; fail if it is unreachable
    Daemon,
    /// Daemon if reachable, else local with a warning
    Auto,
}

impl SpawnOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnOwner::Local => "local",
            SpawnOwner::Daemon => "daemon",
            SpawnOwner::Auto => "auto",
        }
    }
}

impl fmt::Display for SpawnOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpawnOwner {
    type Err = LoopdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(SpawnOwner::Local),
            "daemon" => Ok(SpawnOwner::Daemon),
            "auto" => Ok(SpawnOwner::Auto),
            other => Err(LoopdError::InvalidArgument(format!(
                "unknown owner mode '{other}' (expected local, daemon or auto)"
            ))),
        }
    }
}

/// Who ended up owning the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub owner: OwnerKind,
    pub instance_id: String,
    /// Non-fatal notice for the caller, e.g. a daemon fallback
    pub warning: Option<String>,
}

/// Resolves requested ownership modes into claimed loops.
pub struct OwnershipResolver {
    store: Arc<Store>,
    link: Arc<dyn DaemonLink>,
    local_instance_id: String,
    stale_threshold_ms: i64,
}

impl OwnershipResolver {
    pub fn new(
        store: Arc<Store>,
        link: Arc<dyn DaemonLink>,
        local_instance_id: impl Into<String>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            store,
            link,
            local_instance_id: local_instance_id.into(),
            stale_threshold_ms: stale_threshold.as_millis() as i64,
        }
    }

    pub fn local_instance_id(&self) -> &str {
        &self.local_instance_id
    }

    /// Claim `loop_id` per `requested`. An absent request means local.
    pub async fn resolve(&self, loop_id: &str, requested: Option<SpawnOwner>) -> Result<Resolution> {
        let mode = requested.unwrap_or_default();
        debug!("Resolving owner for {} with mode {}", loop_id, mode);

        match mode {
            SpawnOwner::Local => self.claim_local(loop_id).await,
            SpawnOwner::Daemon => {
                self.link.ping().await?;
                self.claim_daemon(loop_id).await
            }
            SpawnOwner::Auto => {
                let reason = match self.link.ping().await {
                    Ok(_) => match self.claim_daemon(loop_id).await {
                        Err(LoopdError::Unreachable(reason)) => reason,
                        other => return other,
                    },
                    Err(LoopdError::Unreachable(reason)) => reason,
                    Err(e) => return Err(e),
                };
                warn!("Daemon unreachable for {}: {}", loop_id, reason);
                let mut resolution = self.claim_local(loop_id).await?;
                resolution.warning = Some(format!("daemon unreachable ({reason}); running locally"));
                Ok(resolution)
            }
        }
    }

    async fn claim_local(&self, loop_id: &str) -> Result<Resolution> {
        let mut attempt = 1;
        loop {
            match self.store.loops().claim_owner(
                loop_id,
                OwnerKind::Local,
                &self.local_instance_id,
                now_ms(),
                self.stale_threshold_ms,
            ) {
                Ok(_) => {
                    info!("Loop {} claimed locally by {}", loop_id, self.local_instance_id);
                    return Ok(Resolution {
                        owner: OwnerKind::Local,
                        instance_id: self.local_instance_id.clone(),
                        warning: None,
                    });
                }
                // A release may be in flight; retry briefly before reporting
                Err(e) if e.is_transient() && attempt < CLAIM_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(CLAIM_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn claim_daemon(&self, loop_id: &str) -> Result<Resolution> {
        let instance_id = self.link.start_loop_runner(loop_id).await?;
        info!("Loop {} handed to daemon {}", loop_id, instance_id);
        Ok(Resolution {
            owner: OwnerKind::Daemon,
            instance_id,
            warning: None,
        })
    }
}

/// Restarts reclaimed loops on the daemon; used by sweeps run outside it.
#[async_trait]
impl Restarter for OwnershipResolver {
    async fn restart(&self, loop_id: &str) -> Result<OwnerKind> {
        Ok(self.resolve(loop_id, Some(SpawnOwner::Daemon)).await?.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::PingInfo;
    use crate::domain::LoopConfig;
    use crate::store::test_support::temp_store;
    use std::sync::Mutex;

    /// In-memory daemon that records start requests.
    #[derive(Default)]
    struct FakeLink {
        down: bool,
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DaemonLink for FakeLink {
        async fn ping(&self) -> Result<PingInfo> {
            if self.down {
                return Err(LoopdError::Unreachable("connection refused".into()));
            }
            Ok(PingInfo {
                version: "test".into(),
                server_time: now_ms(),
            })
        }

        async fn start_loop_runner(&self, loop_id: &str) -> Result<String> {
            self.started.lock().unwrap().push(loop_id.to_string());
            Ok("daemon-1-00000001".into())
        }

        async fn stop_loop_runner(&self, _loop_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn resolver(link: Arc<FakeLink>) -> (OwnershipResolver, Arc<Store>, tempfile::TempDir) {
        let (store, temp) = temp_store();
        let store = Arc::new(store);
        let resolver = OwnershipResolver::new(
            Arc::clone(&store),
            link,
            "local-1-aaaaaaaa",
            Duration::from_secs(2700),
        );
        (resolver, store, temp)
    }

    #[test]
    fn test_spawn_owner_parse() {
        assert_eq!("LOCAL".parse::<SpawnOwner>().unwrap(), SpawnOwner::Local);
        assert_eq!("auto".parse::<SpawnOwner>().unwrap(), SpawnOwner::Auto);
        assert!("remote".parse::<SpawnOwner>().is_err());
        assert_eq!(SpawnOwner::default(), SpawnOwner::Local);
    }

    #[tokio::test]
    async fn test_absent_mode_is_local_without_probe() {
        let link = Arc::new(FakeLink::default());
        let (resolver, store, _temp) = resolver(Arc::clone(&link));
        let record = store.loops().create("a", LoopConfig::shell("true")).unwrap();

        let resolution = resolver.resolve(&record.id, None).await.unwrap();
        assert_eq!(resolution.owner, OwnerKind::Local);
        assert!(link.started.lock().unwrap().is_empty());

        let record = store.loops().require(&record.id).unwrap();
        assert_eq!(record.owner_kind, Some(OwnerKind::Local));
        assert_eq!(record.owner_instance_id.as_deref(), Some("local-1-aaaaaaaa"));
    }

    #[tokio::test]
    async fn test_auto_prefers_daemon() {
        let link = Arc::new(FakeLink::default());
        let (resolver, store, _temp) = resolver(Arc::clone(&link));
        let record = store.loops().create("a", LoopConfig::shell("true")).unwrap();

        let resolution = resolver.resolve(&record.id, Some(SpawnOwner::Auto)).await.unwrap();
        assert_eq!(resolution.owner, OwnerKind::Daemon);
        assert!(resolution.warning.is_none());
        assert_eq!(*link.started.lock().unwrap(), vec![record.id]);
    }

    #[tokio::test]
    async fn test_auto_falls_back_with_warning() {
        let link = Arc::new(FakeLink {
            down: true,
            ..Default::default()
        });
        let (resolver, store, _temp) = resolver(link);
        let record = store.loops().create("a", LoopConfig::shell("true")).unwrap();

        let resolution = resolver.resolve(&record.id, Some(SpawnOwner::Auto)).await.unwrap();
        assert_eq!(resolution.owner, OwnerKind::Local);
        assert!(resolution.warning.unwrap().contains("running locally"));
    }

    #[tokio::test]
    async fn test_explicit_daemon_fails_when_unreachable() {
        let link = Arc::new(FakeLink {
            down: true,
            ..Default::default()
        });
        let (resolver, store, _temp) = resolver(link);
        let record = store.loops().create("a", LoopConfig::shell("true")).unwrap();

        let err = resolver.resolve(&record.id, Some(SpawnOwner::Daemon)).await.unwrap_err();
        assert!(matches!(err, LoopdError::Unreachable(_)));
        assert!(store.loops().require(&record.id).unwrap().owner_instance_id.is_none());
    }

    #[tokio::test]
    async fn test_live_owner_conflicts() {
        let link = Arc::new(FakeLink::default());
        let (resolver, store, _temp) = resolver(link);
        let record = store.loops().create("a", LoopConfig::shell("true")).unwrap();
        store
            .loops()
            .claim_owner(&record.id, OwnerKind::Daemon, "daemon-9", now_ms(), 2_700_000)
            .unwrap();

        let err = resolver.resolve(&record.id, None).await.unwrap_err();
        assert!(matches!(err, LoopdError::OwnershipConflict { .. }));
    }

    #[tokio::test]
    async fn test_unknown_loop() {
        let link = Arc::new(FakeLink::default());
        let (resolver, _store, _temp) = resolver(link);
        assert!(matches!(
            resolver.resolve("missing", None).await,
            Err(LoopdError::LoopNotFound(_))
        ));
    }
}
