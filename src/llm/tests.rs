use super::*;
use crate::ReviewError;
use crate::testing::FakeModel;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn catalog_creates_each_model_once() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let catalog = ModelCatalog::new(move |model| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeModel::replying(model, "ok")) as Arc<dyn LanguageModel>)
    });

    let first = catalog.get("qwen2.5-coder:7b").expect("can create model");
    let second = catalog.get("qwen2.5-coder:7b").expect("can reuse model");
    let other = catalog.get("llama3:8b").expect("can create other model");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(other.model_id(), "llama3:8b");
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[test]
fn fixed_catalog_rejects_unknown_models() {
    let catalog = ModelCatalog::fixed(vec![
        Arc::new(FakeModel::replying("known", "ok")) as Arc<dyn LanguageModel>,
    ]);

    assert!(catalog.get("known").is_ok());
    assert!(matches!(catalog.get("unknown"), Err(ReviewError::Config(_))));
}

#[tokio::test]
async fn factory_errors_are_not_cached() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let catalog = ModelCatalog::new(move |model| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ReviewError::Unreachable("not yet".to_string()))
        } else {
            Ok(Arc::new(FakeModel::replying(model, "ready")) as Arc<dyn LanguageModel>)
        }
    });

    assert!(catalog.get("m").is_err());
    let model = catalog.get("m").expect("second attempt succeeds");
    let reply = model
        .call("hello", &CancelToken::never())
        .await
        .expect("can call model");
    assert_eq!(reply, "ready");
}
