//! Scoped remote acquisition.

use super::RemoteHandler;
use crate::utils::errors::Result;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// A synced handler that is forgotten again when the session ends.
///
/// Call [`RemoteSession::release`] on the normal path. A session dropped
/// without release (early return, panic, cancelled future) schedules the
/// teardown on the current runtime.
pub struct RemoteSession {
    handler: Arc<dyn RemoteHandler>,
    released: bool,
}

impl RemoteSession {
    pub async fn acquire(handler: Arc<dyn RemoteHandler>) -> Result<Self> {
        handler.sync().await?;
        debug!(remote = %handler.id(), kind = %handler.kind(), "Remote session acquired");
        Ok(Self {
            handler,
            released: false,
        })
    }

    pub fn handler(&self) -> &Arc<dyn RemoteHandler> {
        &self.handler
    }

    pub async fn release(mut self) {
        self.released = true;
        self.handler.forget().await;
        debug!(remote = %self.handler.id(), "Remote session released");
    }

    /// Run `f` with an acquired handler and release it on every outcome
    pub async fn scoped<T, F, Fut>(handler: Arc<dyn RemoteHandler>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RemoteHandler>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = Self::acquire(handler).await?;
        let result = f(Arc::clone(&session.handler)).await;
        session.release().await;
        result
    }
}

impl Deref for RemoteSession {
    type Target = dyn RemoteHandler;

    fn deref(&self) -> &Self::Target {
        self.handler.as_ref()
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handler = Arc::clone(&self.handler);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handler.forget().await });
            }
            Err(_) => {
                tracing::warn!(remote = %handler.id(), "Remote session dropped outside a runtime, not released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mount::tests::FakeMounter;
    use crate::remote::{MountHandler, MountSpec, Mounter, RemoteKind};
    use crate::utils::errors::BackupError;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn mounted(dir: &TempDir) -> (Arc<FakeMounter>, Arc<dyn RemoteHandler>) {
        let mounter = Arc::new(FakeMounter::default());
        let spec = MountSpec::nfs("nas.lan", "/export", dir.path().join("nas"), None);
        let handler = MountHandler::new("nas", RemoteKind::Nfs, true, spec, Arc::clone(&mounter) as Arc<dyn Mounter>);
        (mounter, Arc::new(handler))
    }

    #[tokio::test]
    async fn test_scoped_releases_on_error() {
        let dir = TempDir::new().unwrap();
        let (mounter, handler) = mounted(&dir);

        let result: Result<()> = RemoteSession::scoped(handler, |h| async move {
            assert!(h.exists("").await?);
            Err(BackupError::Metadata("boom".into()))
        })
        .await;

        assert!(matches!(result, Err(BackupError::Metadata(_))));
        assert_eq!(mounter.mounts.load(Ordering::SeqCst), 1);
        assert!(!mounter.is_mounted(&dir.path().join("nas")).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_schedules_release() {
        let dir = TempDir::new().unwrap();
        let (mounter, handler) = mounted(&dir);

        {
            let session = RemoteSession::acquire(handler).await.unwrap();
            assert_eq!(session.id(), "nas");
        }

        // Let the spawned teardown run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mounter.unmounts.load(Ordering::SeqCst), 1);
    }
}
