use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use image::RgbaImage;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::FilterError;
use crate::lut::{LutAsset, LutId, LutTexture};

/// Byte access to bundled LUT resources.
pub trait AssetSource: Send + Sync {
    fn read(&self, asset: &LutAsset) -> Result<Vec<u8>, FilterError>;
}

/// Raw bytes to an RGBA bitmap.
pub trait LutDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<RgbaImage, FilterError>;
}

/// Reads assets from `<root>/<file_name>`.
#[derive(Debug, Clone)]
pub struct DirAssetSource {
    root: PathBuf,
}

impl DirAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, asset: &LutAsset) -> PathBuf {
        self.root.join(asset.file_name)
    }
}

impl AssetSource for DirAssetSource {
    fn read(&self, asset: &LutAsset) -> Result<Vec<u8>, FilterError> {
        let path = self.path_for(asset);
        std::fs::read(&path)
            .map_err(|err| FilterError::AssetNotFound(format!("{}: {err}", path.display())))
    }
}

/// In-memory assets, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetSource {
    files: HashMap<&'static str, Arc<[u8]>>,
}

impl MemoryAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: LutId, bytes: impl Into<Arc<[u8]>>) -> Self {
        if let Some(asset) = id.asset() {
            self.files.insert(asset.file_name, bytes.into());
        }
        self
    }
}

impl AssetSource for MemoryAssetSource {
    fn read(&self, asset: &LutAsset) -> Result<Vec<u8>, FilterError> {
        self.files
            .get(asset.file_name)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| FilterError::AssetNotFound(asset.file_name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl LutDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<RgbaImage, FilterError> {
        image::load_from_memory(bytes)
            .map(|img| img.into_rgba8())
            .map_err(|err| FilterError::DecodeFailure(err.to_string()))
    }
}

type PendingLoad = Shared<BoxFuture<'static, Option<Arc<LutTexture>>>>;

#[derive(Default)]
struct LoaderState {
    textures: HashMap<LutId, Arc<LutTexture>>,
    in_flight: HashMap<LutId, PendingLoad>,
    /// Bumped by `clear`; loads started under an older epoch don't store.
    /// Their in-flight entries stay joinable until the load finishes.
    epoch: u64,
}

struct Inner {
    state: Mutex<LoaderState>,
    source: Arc<dyn AssetSource>,
    decoder: Arc<dyn LutDecoder>,
}

/// Resolves filter identifiers to decoded LUT textures.
///
/// Completed textures are memoized; concurrent requests for the same id share
/// one in-flight load, so at most one decode per id runs at a time. Must be
/// used from within a tokio runtime.
#[derive(Clone)]
pub struct LutLoader {
    inner: Arc<Inner>,
}

impl LutLoader {
    pub fn new(source: Arc<dyn AssetSource>, decoder: Arc<dyn LutDecoder>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LoaderState::default()),
                source,
                decoder,
            }),
        }
    }

    /// `None` for `Normal` and for any load failure; failures are logged and
    /// retried on the next call.
    pub async fn load(&self, id: LutId) -> Option<Arc<LutTexture>> {
        let asset = id.asset()?;
        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(texture) = state.textures.get(&id) {
                return Some(texture.clone());
            }
            match state.in_flight.get(&id) {
                Some(pending) => {
                    debug!(lut = %id, "joining in-flight lut load");
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_load(id, asset, state.epoch);
                    state.in_flight.insert(id, pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Starts loads for `ids` without waiting on them.
    pub fn preload(&self, ids: &[LutId]) {
        for &id in ids {
            let loader = self.clone();
            tokio::spawn(async move {
                loader.load(id).await;
            });
        }
    }

    pub fn texture_count(&self) -> usize {
        self.inner.state.lock().textures.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn is_loaded(&self, id: LutId) -> bool {
        self.inner.state.lock().textures.contains_key(&id)
    }

    /// Drops every texture. Loads still running keep serving their callers,
    /// including ones that join after the clear, but are not stored.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.textures.clear();
        state.epoch += 1;
    }

    fn spawn_load(&self, id: LutId, asset: LutAsset, epoch: u64) -> PendingLoad {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let source = inner.source.clone();
            let decoder = inner.decoder.clone();
            let decoded = tokio::task::spawn_blocking(move || fetch(&*source, &*decoder, id, &asset))
                .await
                .unwrap_or_else(|err| {
                    Err(FilterError::DecodeFailure(format!("decode task failed: {err}")))
                });

            let mut state = inner.state.lock();
            let current = state.epoch == epoch;
            state.in_flight.remove(&id);
            match decoded {
                Ok(texture) => {
                    let texture = Arc::new(texture);
                    if current {
                        state.textures.insert(id, texture.clone());
                    }
                    debug!(lut = %id, stored = current, "lut loaded");
                    Some(texture)
                }
                Err(err) => {
                    warn!(lut = %id, %err, "lut load failed; filter will pass through");
                    None
                }
            }
        });
        async move {
            task.await.unwrap_or_else(|err| {
                warn!(lut = %id, %err, "lut load task aborted");
                None
            })
        }
        .boxed()
        .shared()
    }
}

fn fetch(
    source: &dyn AssetSource,
    decoder: &dyn LutDecoder,
    id: LutId,
    asset: &LutAsset,
) -> Result<LutTexture, FilterError> {
    let bytes = source.read(asset)?;
    let image = decoder.decode(&bytes)?;
    LutTexture::new(id, image)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use image::{ImageFormat, RgbaImage};

    use super::*;
    use crate::lut::identity_lut;

    fn png_bytes(img: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .expect("png encode should succeed");
        out.into_inner()
    }

    /// Decodes through the image crate after a delay, counting calls and
    /// the highest number of decodes running at once.
    struct SlowDecoder {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl SlowDecoder {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    impl LutDecoder for SlowDecoder {
        fn decode(&self, bytes: &[u8]) -> Result<RgbaImage, FilterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            ImageCrateDecoder.decode(bytes)
        }
    }

    fn loader_with(source: MemoryAssetSource, decoder: Arc<SlowDecoder>) -> LutLoader {
        LutLoader::new(Arc::new(source), decoder)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_loads_share_one_decode() {
        let decoder = SlowDecoder::new(50);
        let loader = loader_with(
            MemoryAssetSource::new().with(LutId::Lut1, png_bytes(&identity_lut())),
            decoder.clone(),
        );

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.load(LutId::Lut1).await })
            })
            .collect();
        let mut textures = Vec::new();
        for handle in handles {
            textures.push(handle.await.unwrap().expect("lut should load"));
        }

        assert_eq!(decoder.calls(), 1);
        for texture in &textures[1..] {
            assert!(Arc::ptr_eq(&textures[0], texture));
        }
        assert_eq!(loader.texture_count(), 1);
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn completed_load_is_memoized() {
        let decoder = SlowDecoder::new(0);
        let loader = loader_with(
            MemoryAssetSource::new().with(LutId::Lut2, png_bytes(&identity_lut())),
            decoder.clone(),
        );
        let first = loader.load(LutId::Lut2).await.unwrap();
        let second = loader.load(LutId::Lut2).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), LutId::Lut2);
        assert_eq!(decoder.calls(), 1);
    }

    #[tokio::test]
    async fn normal_never_touches_the_decoder() {
        let decoder = SlowDecoder::new(0);
        let loader = loader_with(MemoryAssetSource::new(), decoder.clone());
        assert!(loader.load(LutId::Normal).await.is_none());
        assert_eq!(decoder.calls(), 0);
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn failures_resolve_to_none_and_are_not_cached() {
        let decoder = SlowDecoder::new(0);
        let loader = loader_with(
            MemoryAssetSource::new()
                .with(LutId::Lut2, b"not an image".to_vec())
                .with(LutId::Lut3, png_bytes(&RgbaImage::new(64, 64))),
            decoder.clone(),
        );

        // missing asset: no decode attempted
        assert!(loader.load(LutId::Lut1).await.is_none());
        assert_eq!(decoder.calls(), 0);
        // undecodable bytes
        assert!(loader.load(LutId::Lut2).await.is_none());
        // wrong dimensions
        assert!(loader.load(LutId::Lut3).await.is_none());
        assert_eq!(decoder.calls(), 2);

        assert_eq!(loader.texture_count(), 0);
        assert_eq!(loader.in_flight_count(), 0);
        assert!(loader.load(LutId::Lut2).await.is_none());
        assert_eq!(decoder.calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_during_load_discards_the_stale_texture() {
        let decoder = SlowDecoder::new(80);
        let loader = loader_with(
            MemoryAssetSource::new().with(LutId::Lut4, png_bytes(&identity_lut())),
            decoder.clone(),
        );

        let waiter = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(LutId::Lut4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        loader.clear();

        assert!(waiter.await.unwrap().is_some(), "caller still gets its texture");
        assert!(!loader.is_loaded(LutId::Lut4));

        loader.load(LutId::Lut4).await.expect("reload after clear");
        assert_eq!(decoder.calls(), 2);
        assert!(loader.is_loaded(LutId::Lut4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_started_after_clear_joins_the_running_decode() {
        let decoder = SlowDecoder::new(150);
        let loader = loader_with(
            MemoryAssetSource::new().with(LutId::Lut1, png_bytes(&identity_lut())),
            decoder.clone(),
        );

        let before = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(LutId::Lut1).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        loader.clear();
        let after = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(LutId::Lut1).await })
        };

        let before = before.await.unwrap().expect("first caller gets a texture");
        let after = after.await.unwrap().expect("second caller gets a texture");
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(decoder.peak(), 1);
        assert_eq!(decoder.calls(), 1);
        assert!(!loader.is_loaded(LutId::Lut1));
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preload_fills_the_cache_in_the_background() {
        let decoder = SlowDecoder::new(0);
        let loader = loader_with(
            MemoryAssetSource::new()
                .with(LutId::Lut1, png_bytes(&identity_lut()))
                .with(LutId::Lut2, png_bytes(&identity_lut())),
            decoder.clone(),
        );
        loader.preload(&[LutId::Lut1, LutId::Lut2, LutId::Normal]);
        for _ in 0..200 {
            if loader.texture_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(loader.texture_count(), 2);
        assert_eq!(decoder.calls(), 2);
    }

    #[test]
    fn dir_source_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirAssetSource::new(dir.path());
        let asset = LutId::Lut5.asset().unwrap();
        assert!(matches!(
            source.read(&asset),
            Err(FilterError::AssetNotFound(_))
        ));

        std::fs::write(source.path_for(&asset), b"bytes").unwrap();
        assert_eq!(source.read(&asset).unwrap(), b"bytes");
    }
}
