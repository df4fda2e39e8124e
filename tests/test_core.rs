use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, Rgb, RgbImage};

use visimatch::{
    filter, AppError, Backend, CatalogItem, Embedding, EmbeddingCache, EmbeddingProvider,
    ImageReference, ImageResolver, ManualClock, ModelHandle, ModelLoader, ModelState, PriceRange,
    SearchConfig, SearchOrchestrator, VisionModel,
};

/// Embeds an image as its mean RGB colour; a pure red `(255, 0, 0)` image
/// stalls for half a second and pure blue `(0, 0, 255)` yields a 4-d vector.
#[derive(Debug)]
struct ColourModel {
    calls: Arc<AtomicUsize>,
}

impl VisionModel for ColourModel {
    fn name(&self) -> &str {
        "mean-colour"
    }

    fn embed(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rgb = image.to_rgb8();
        let pixels = (rgb.width() * rgb.height()) as f32;
        let mut mean = [0.0f32; 3];
        for pixel in rgb.pixels() {
            for channel in 0..3 {
                mean[channel] += pixel[channel] as f32 / 255.0 / pixels;
            }
        }

        if rgb.get_pixel(0, 0) == &Rgb([255, 0, 0]) {
            std::thread::sleep(Duration::from_millis(500));
        }
        if rgb.get_pixel(0, 0) == &Rgb([0, 0, 255]) {
            return Ok(vec![0.0, 0.0, 1.0, 0.0]);
        }
        Ok(mean.to_vec())
    }
}

#[derive(Debug, Default)]
struct ColourLoader {
    calls: Arc<AtomicUsize>,
    loads: AtomicUsize,
    load_delay: Duration,
    fail: bool,
}

impl ModelLoader for ColourLoader {
    fn load(&self, backend: Backend) -> anyhow::Result<Arc<dyn VisionModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        if self.fail {
            anyhow::bail!("no {:?} runtime", backend);
        }
        Ok(Arc::new(ColourModel {
            calls: Arc::clone(&self.calls),
        }))
    }
}

fn png_data_uri(r: u8, g: u8, b: u8) -> String {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([r, g, b])));
    let mut buffer = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageOutputFormat::Png).unwrap();
    format!("data:image/png;base64,{}", STANDARD.encode(buffer.into_inner()))
}

fn product(id: u64, category: &str, price: f64, image: String) -> CatalogItem {
    CatalogItem {
        id,
        name: format!("product-{}", id),
        category: category.to_string(),
        price,
        image: ImageReference::new(image),
    }
}

/// Five products; the third has an image that can't be decoded.
fn catalog() -> Vec<CatalogItem> {
    vec![
        product(1, "Shoes", 80.0, png_data_uri(200, 50, 50)),
        product(2, "Bags", 40.0, png_data_uri(50, 50, 200)),
        product(3, "Shoes", 60.0, "data:image/png;base64,bm90IGFuIGltYWdl".to_string()),
        product(4, "Shoes", 10.0, png_data_uri(100, 25, 25)),
        product(5, "Hats", 10.0, png_data_uri(50, 200, 50)),
    ]
}

struct Harness {
    orchestrator: SearchOrchestrator,
    provider: Arc<EmbeddingProvider>,
    calls: Arc<AtomicUsize>,
    clock: Arc<ManualClock>,
}

fn harness(config: SearchConfig) -> Harness {
    let loader = ColourLoader::default();
    let calls = Arc::clone(&loader.calls);
    let clock = Arc::new(ManualClock::new());
    let cache = Arc::new(EmbeddingCache::with_clock(Duration::from_secs(3600), clock.clone()));
    let provider = Arc::new(EmbeddingProvider::new(
        Arc::new(ModelHandle::new(Arc::new(loader))),
        cache,
        ImageResolver::default(),
    ));

    Harness {
        orchestrator: SearchOrchestrator::new(Arc::clone(&provider), config),
        provider,
        calls,
        clock,
    }
}

fn query() -> ImageReference {
    ImageReference::new(png_data_uri(200, 50, 50))
}

fn ids(items: &[visimatch::ScoredItem]) -> Vec<u64> {
    items.iter().map(|item| item.item.id).collect()
}

#[tokio::test]
async fn test_search_tolerates_item_failure() {
    let h = harness(SearchConfig {
        concurrency: 3,
        item_timeout: None,
    });
    let progress = Mutex::new(Vec::new());

    let outcome = h
        .orchestrator
        .search(&query(), &catalog(), |current, total| {
            progress.lock().unwrap().push((current, total));
        })
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, 4);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.ranked.len(), 4);
    assert_eq!(outcome.failures[0].item_id, 3);
    assert_eq!(
        progress.into_inner().unwrap(),
        vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]
    );
}

#[tokio::test]
async fn test_ranking_is_descending_and_stable() {
    let h = harness(SearchConfig {
        concurrency: 5,
        item_timeout: None,
    });

    let outcome = h.orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();

    // 1 and 4 are parallel to the query, 2 and 5 sit at cos = 0.5
    assert_eq!(ids(&outcome.ranked), vec![1, 4, 2, 5]);
    let scores: Vec<_> = outcome.ranked.iter().map(|item| item.similarity).collect();
    assert_eq!(scores, vec![Some(100), Some(100), Some(75), Some(75)]);
}

#[tokio::test]
async fn test_second_search_is_served_from_cache() {
    let h = harness(SearchConfig::default());

    let first = h.orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();
    let calls_after_first = h.calls.load(Ordering::SeqCst);
    // product 1 shares the query's image, and the broken image never reaches the model
    assert_eq!(calls_after_first, 4);

    let second = h.orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();

    assert_eq!(h.calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(first.ranked, second.ranked);
    assert_eq!(second.failed, 1);
    assert_eq!(h.provider.cache().size(), 4);
}

#[tokio::test]
async fn test_expired_cache_recomputes() {
    let h = harness(SearchConfig::default());
    h.orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();

    h.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.provider.cache().sweep(), 4);

    h.orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_invalid_query_aborts_before_catalog() {
    let h = harness(SearchConfig::default());
    let mut progress_calls = 0;

    let err = h
        .orchestrator
        .search(
            &ImageReference::new("data:image/png;base64,bm90IGFuIGltYWdl"),
            &catalog(),
            |_, _| progress_calls += 1,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InvalidQueryImage(_)));
    assert_eq!(progress_calls, 0);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_model_load_failure_is_fatal() {
    let provider = Arc::new(EmbeddingProvider::new(
        Arc::new(ModelHandle::new(Arc::new(ColourLoader {
            fail: true,
            ..Default::default()
        }))),
        Arc::new(EmbeddingCache::default()),
        ImageResolver::default(),
    ));
    let orchestrator = SearchOrchestrator::new(provider, SearchConfig::default());

    let err = orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap_err();

    assert!(matches!(err, AppError::ModelLoad(_)));
}

#[tokio::test]
async fn test_total_failure_returns_empty_ranking() {
    let h = harness(SearchConfig::default());
    let broken: Vec<_> = (1..=3)
        .map(|id| product(id, "Shoes", 5.0, format!("missing/product-{}.png", id)))
        .collect();

    let outcome = h.orchestrator.search(&query(), &broken, |_, _| {}).await.unwrap();

    assert!(outcome.ranked.is_empty());
    assert_eq!(outcome.succeeded, 0);
    assert_eq!(outcome.failed, 3);
}

#[tokio::test]
async fn test_empty_catalog() {
    let h = harness(SearchConfig::default());
    let mut progress_calls = 0;

    let outcome = h
        .orchestrator
        .search(&query(), &[], |_, _| progress_calls += 1)
        .await
        .unwrap();

    assert!(outcome.ranked.is_empty());
    assert_eq!(progress_calls, 0);
}

#[tokio::test]
async fn test_scoring_failures_are_item_failures() {
    let h = harness(SearchConfig::default());
    let items = vec![
        product(1, "Shoes", 5.0, png_data_uri(0, 0, 0)),
        product(2, "Shoes", 5.0, png_data_uri(0, 0, 255)),
        product(3, "Shoes", 5.0, png_data_uri(10, 200, 10)),
    ];

    let outcome = h.orchestrator.search(&query(), &items, |_, _| {}).await.unwrap();

    assert_eq!(ids(&outcome.ranked), vec![3]);
    assert_eq!(outcome.failed, 2);
    assert!(outcome.failures[0].reason.contains("Degenerate"));
    assert!(outcome.failures[1].reason.contains("Dimension mismatch"));
}

#[tokio::test]
async fn test_slow_item_times_out() {
    let h = harness(SearchConfig {
        concurrency: 2,
        item_timeout: Some(Duration::from_millis(100)),
    });
    let items = vec![
        product(1, "Shoes", 5.0, png_data_uri(255, 0, 0)),
        product(2, "Shoes", 5.0, png_data_uri(200, 50, 50)),
    ];

    let outcome = h.orchestrator.search(&query(), &items, |_, _| {}).await.unwrap();

    assert_eq!(ids(&outcome.ranked), vec![2]);
    assert_eq!(outcome.failures[0].item_id, 1);
    assert!(outcome.failures[0].reason.contains("timed out"));
}

#[tokio::test]
async fn test_filtering_ranked_results() {
    let h = harness(SearchConfig::default());
    let outcome = h.orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();
    let everything = PriceRange::new(0.0, 100.0).unwrap();

    assert_eq!(ids(&filter(&outcome.ranked, 80, "all", everything)), vec![1, 4]);
    assert_eq!(ids(&filter(&outcome.ranked, 0, "Shoes", everything)), vec![1, 4]);
    assert_eq!(
        ids(&filter(&outcome.ranked, 0, "all", PriceRange::new(10.0, 10.0).unwrap())),
        vec![4, 5]
    );
}

#[tokio::test]
async fn test_slow_model_load_is_not_an_item_timeout() {
    let loader = Arc::new(ColourLoader {
        load_delay: Duration::from_millis(300),
        ..Default::default()
    });
    let provider = Arc::new(EmbeddingProvider::new(
        Arc::new(ModelHandle::new(loader.clone())),
        Arc::new(EmbeddingCache::default()),
        ImageResolver::default(),
    ));
    let orchestrator = SearchOrchestrator::new(
        Arc::clone(&provider),
        SearchConfig {
            concurrency: 2,
            item_timeout: Some(Duration::from_millis(100)),
        },
    );

    let outcome = orchestrator.search(&query(), &catalog(), |_, _| {}).await.unwrap();

    assert_eq!(outcome.succeeded, 4);
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert!(matches!(provider.model_state(), ModelState::Ready { .. }));
}

#[tokio::test]
async fn test_model_load_failure_is_fatal_with_warm_cache() {
    let items = vec![product(1, "Shoes", 5.0, png_data_uri(10, 20, 30))];
    let cache = Arc::new(EmbeddingCache::default());
    cache.set(&query(), Embedding::from(vec![1.0, 0.0, 0.0]));
    cache.set(&items[0].image, Embedding::from(vec![0.5, 0.5, 0.0]));

    let provider = Arc::new(EmbeddingProvider::new(
        Arc::new(ModelHandle::new(Arc::new(ColourLoader {
            fail: true,
            ..Default::default()
        }))),
        cache,
        ImageResolver::default(),
    ));
    let orchestrator = SearchOrchestrator::new(provider, SearchConfig::default());

    let err = orchestrator.search(&query(), &items, |_, _| {}).await.unwrap_err();

    assert!(matches!(err, AppError::ModelLoad(_)));
}
