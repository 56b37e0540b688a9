//! Keeps the advertised set in sync with the local content store.
//!
//! The whole set is re-published on a fixed period shorter than the DHT
//! record TTL, so provider records never expire while the content is still
//! present. Removals are not retracted eagerly; expiry handles them within
//! one TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::oci::{ImageEvent, OciClient};
use crate::routing::Router;

/// Default re-publication period, half the record TTL.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Periodic content advertiser
pub struct Advertiser {
    oci: Arc<dyn OciClient>,
    router: Arc<dyn Router>,
    period: Duration,
    resolve_latest_tag: bool,
}

impl Advertiser {
    pub fn new(
        oci: Arc<dyn OciClient>,
        router: Arc<dyn Router>,
        period: Duration,
        resolve_latest_tag: bool,
    ) -> Self {
        Self {
            oci,
            router,
            period,
            resolve_latest_tag,
        }
    }

    /// Run the advertisement loop.
    ///
    /// Ticks immediately on startup, then every period. When the store
    /// exposes a change feed, additions are advertised eagerly between
    /// ticks. Failures are logged and retried on the next cycle.
    pub async fn run(self, events: Option<mpsc::Receiver<ImageEvent>>) {
        let mut events = events;
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.advertise_all().await {
                        Ok(count) => {
                            tracing::debug!(keys = count, "advertised local content");
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "failed to advertise local content");
                        }
                    }
                }
                maybe_event = recv_event(&mut events) => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        // Feed closed; fall back to the ticker alone.
                        None => events = None,
                    }
                }
            }
        }
    }

    /// Advertise every key derivable from the local store. Returns the
    /// number of keys published.
    pub async fn advertise_all(&self) -> Result<usize> {
        let images = self.oci.list_images().await?;
        let mut keys = Vec::new();
        for image in &images {
            keys.extend(image.advertised_keys(self.resolve_latest_tag));
        }
        keys.sort();
        keys.dedup();
        let count = keys.len();
        self.router.advertise(keys).await?;
        Ok(count)
    }

    async fn handle_event(&self, event: ImageEvent) {
        match event {
            ImageEvent::Added(image) => {
                let keys = image.advertised_keys(self.resolve_latest_tag);
                tracing::debug!(reference = %image.reference, keys = keys.len(), "advertising new image");
                if let Err(err) = self.router.advertise(keys).await {
                    tracing::error!(error = %err, "failed to advertise new image");
                }
            }
            ImageEvent::Removed(reference) => {
                // Provider records expire on their own; nothing to retract.
                tracing::debug!(reference, "image removed, waiting for record expiry");
            }
        }
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<ImageEvent>>) -> Option<ImageEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use crate::error::Error;
    use crate::oci::{BlobStream, Digest, Image, ImageReference};

    struct StaticStore {
        images: Vec<Image>,
    }

    #[async_trait]
    impl OciClient for StaticStore {
        async fn list_images(&self) -> Result<Vec<Image>> {
            Ok(self.images.clone())
        }

        async fn resolve(&self, reference: &str) -> Result<Digest> {
            Err(Error::not_found(reference))
        }

        async fn get_manifest(&self, digest: &Digest) -> Result<(Bytes, String)> {
            Err(Error::not_found(digest.as_str()))
        }

        async fn size(&self, digest: &Digest) -> Result<u64> {
            Err(Error::not_found(digest.as_str()))
        }

        async fn get_blob(&self, digest: &Digest) -> Result<BlobStream> {
            Err(Error::not_found(digest.as_str()))
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        advertised: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Router for RecordingRouter {
        async fn advertise(&self, keys: Vec<String>) -> Result<()> {
            self.advertised.lock().unwrap().push(keys);
            Ok(())
        }

        async fn resolve(
            &self,
            _key: &str,
            _allow_self: bool,
            _max_retries: usize,
        ) -> Result<mpsc::Receiver<IpAddr>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn ready(&self) -> Result<bool> {
            Ok(true)
        }

        fn close(&self) {}
    }

    fn digest(fill: char) -> Digest {
        Digest::parse(format!("sha256:{}", fill.to_string().repeat(64))).unwrap()
    }

    fn image(reference: &str, fill: char) -> Image {
        Image {
            reference: ImageReference::parse(reference).unwrap(),
            digest: digest(fill),
            manifest_digests: vec![],
            config_digest: None,
            layer_digests: vec![],
        }
    }

    #[tokio::test]
    async fn test_advertise_all_publishes_union() {
        let store = Arc::new(StaticStore {
            images: vec![
                image("docker.io/library/alpine:3.18", 'a'),
                image("ghcr.io/owner/repo:v1", 'b'),
            ],
        });
        let router = Arc::new(RecordingRouter::default());
        let advertiser = Advertiser::new(
            store,
            router.clone(),
            DEFAULT_REFRESH_PERIOD,
            true,
        );

        let count = advertiser.advertise_all().await.unwrap();
        assert_eq!(count, 4);

        let advertised = router.advertised.lock().unwrap();
        assert_eq!(advertised.len(), 1);
        assert!(advertised[0].contains(&"docker.io/library/alpine:3.18".to_owned()));
        assert!(advertised[0].contains(&digest('b').to_string()));
    }

    #[tokio::test]
    async fn test_added_event_advertises_eagerly() {
        let store = Arc::new(StaticStore { images: vec![] });
        let router = Arc::new(RecordingRouter::default());
        let advertiser = Advertiser::new(store, router.clone(), DEFAULT_REFRESH_PERIOD, true);

        advertiser
            .handle_event(ImageEvent::Added(image("docker.io/library/alpine:3.18", 'a')))
            .await;

        let advertised = router.advertised.lock().unwrap();
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].len(), 2);
    }
}
