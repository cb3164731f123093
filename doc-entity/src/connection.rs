use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};

use crate::{
    Error, Settings,
    store::{DocumentStore, StoreConnector},
};

type Session<S> = Shared<BoxFuture<'static, Result<S, Arc<Error>>>>;

struct State<S> {
    settings: Arc<Settings>,
    session: Option<Session<S>>,
}

/// Owns the one logical session of a data source.
///
/// The session is a shared future: every caller that arrives while it is
/// being opened awaits the same attempt, and callers after it resolved get
/// the same store back.
pub struct ConnectionManager<C: StoreConnector> {
    connector: Arc<C>,
    state: Arc<Mutex<State<C::Store>>>,
}

impl<C: StoreConnector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            state: self.state.clone(),
        }
    }
}

impl<C: StoreConnector> ConnectionManager<C> {
    pub fn new(connector: C, settings: Settings) -> Self {
        Self {
            connector: Arc::new(connector),
            state: Arc::new(Mutex::new(State {
                settings: Arc::new(settings),
                session: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<C::Store>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.lock().settings.clone()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_connected(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .and_then(|session| session.peek())
            .is_some_and(|result| result.is_ok())
    }

    pub async fn connect(&self) -> Result<C::Store, Error> {
        let session = {
            let mut state = self.lock();
            match &state.session {
                Some(session) => session.clone(),
                None => {
                    let connector = self.connector.clone();
                    let settings = state.settings.clone();
                    debug!(
                        "opening session to {} bucket {}",
                        settings.cluster.url, settings.bucket.name
                    );
                    let session = async move {
                        let store = connector.open(&settings).await.map_err(Arc::new)?;
                        info!("connected to bucket {}", settings.bucket.name);
                        Ok::<_, Arc<Error>>(store)
                    }
                    .boxed()
                    .shared();
                    state.session = Some(session.clone());
                    session
                }
            }
        };

        match session.clone().await {
            Ok(store) => Ok(store),
            Err(e) => {
                let mut state = self.lock();
                // a later caller may already have started a fresh attempt
                if state
                    .session
                    .as_ref()
                    .is_some_and(|current| current.ptr_eq(&session))
                {
                    state.session = None;
                }
                warn!("connect failed: {}", e);
                Err(Error::Connection(e))
            }
        }
    }

    /// The open session, without opening one.
    pub async fn connected(&self) -> Result<C::Store, Error> {
        let session = self.lock().session.clone().ok_or(Error::NotConnected)?;
        session.await.map_err(Error::Connection)
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        let session = self.lock().session.take();
        let Some(session) = session else {
            debug!("disconnect without a session");
            return Ok(());
        };
        match session.await {
            Ok(store) => {
                store.close().await?;
                info!("disconnected");
                Ok(())
            }
            Err(e) => {
                debug!("pending connect had failed: {}", e);
                Ok(())
            }
        }
    }

    /// Replaces the settings; the current session, if any, is closed and
    /// the next operation connects with the new settings.
    pub async fn reconfigure(&self, settings: Settings) -> Result<(), Error> {
        let previous = {
            let mut state = self.lock();
            state.settings = Arc::new(settings);
            state.session.take()
        };
        info!("settings replaced");
        if let Some(previous) = previous {
            if let Ok(store) = previous.await {
                store.close().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryConnector;

    fn manager(connector: &MemoryConnector) -> ConnectionManager<MemoryConnector> {
        ConnectionManager::new(connector.clone(), Settings::default())
    }

    #[tokio::test]
    async fn concurrent_connects_open_one_session() {
        let connector = MemoryConnector::new().with_connect_delay(Duration::from_millis(20));
        let manager = manager(&connector);
        let (a, b, c) = tokio::join!(manager.connect(), manager.connect(), manager.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        manager.connect().await.unwrap();
        assert_eq!(connector.opened(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn disconnect_resets_and_is_idempotent() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        manager.disconnect().await.unwrap();
        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
        assert!(!manager.is_connected());
        assert_eq!(connector.closed(), 1);

        manager.connect().await.unwrap();
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn failed_connects_can_be_retried() {
        let connector = MemoryConnector::new();
        connector.fail_next_connects(1);
        let manager = manager(&connector);
        assert!(matches!(manager.connect().await, Err(Error::Connection(_))));
        assert!(!manager.is_connected());
        assert!(manager.connect().await.is_ok());
    }

    #[tokio::test]
    async fn connected_does_not_open() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        assert!(matches!(manager.connected().await, Err(Error::NotConnected)));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn reconfigure_closes_the_old_session() {
        let connector = MemoryConnector::new();
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        let mut settings = Settings::default();
        settings.bucket.name = "other".into();
        manager.reconfigure(settings).await.unwrap();
        assert_eq!(connector.closed(), 1);
        assert_eq!(manager.settings().bucket.name, "other");
        assert!(!manager.is_connected());
    }
}
