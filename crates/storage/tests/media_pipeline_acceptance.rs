use std::{collections::HashMap, io::Cursor};

use image::{GenericImageView, ImageOutputFormat, Rgb, RgbImage};
use media::{
    ImageOptimizer, OptimizeOutcome, SkipReason, UploadEvent, OPTIMIZED_MARKER_KEY,
    OPTIMIZED_MARKER_VALUE,
};
use storage::Storage;

fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([150, 60, 30]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(90))
        .expect("encode test jpeg");
    bytes
}

#[tokio::test]
async fn stored_product_image_is_normalized_once_and_marked() {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let scratch = tempfile::tempdir().expect("scratch dir");

    let mut metadata = HashMap::new();
    metadata.insert("listing".to_string(), "p1".to_string());
    storage
        .put_media_object(
            "media",
            "products/chair.jpg",
            &jpeg_bytes(2400, 1600),
            Some("image/jpeg"),
            &metadata,
        )
        .await
        .expect("seed object");

    let optimizer = ImageOptimizer::with_scratch_dir(scratch.path());
    let event = UploadEvent {
        bucket: "media".to_string(),
        path: "products/chair.jpg".to_string(),
        content_type: Some("image/jpeg".to_string()),
        custom_metadata: metadata,
    };

    let outcome = optimizer.process(&storage, &event).await;
    assert_eq!(
        outcome,
        OptimizeOutcome::Optimized {
            width: 1080,
            height: 720
        }
    );

    let object = storage
        .get_media_object("media", "products/chair.jpg")
        .await
        .expect("get object")
        .expect("present");
    assert_eq!(
        object.custom_metadata.get(OPTIMIZED_MARKER_KEY),
        Some(&OPTIMIZED_MARKER_VALUE.to_string())
    );
    assert_eq!(
        object.custom_metadata.get("listing"),
        Some(&"p1".to_string())
    );
    assert_eq!(object.content_type.as_deref(), Some("image/jpeg"));
    let decoded = image::load_from_memory(&object.bytes).expect("decode");
    assert_eq!(decoded.dimensions(), (1080, 720));

    // A duplicate delivery after the marker landed is a no-op.
    let redelivered = UploadEvent {
        bucket: "media".to_string(),
        path: "products/chair.jpg".to_string(),
        content_type: object.content_type.clone(),
        custom_metadata: object.custom_metadata.clone(),
    };
    let outcome = optimizer.process(&storage, &redelivered).await;
    assert_eq!(
        outcome,
        OptimizeOutcome::Skipped(SkipReason::AlreadyOptimized)
    );

    let untouched = storage
        .get_media_object("media", "products/chair.jpg")
        .await
        .expect("get object")
        .expect("present");
    assert_eq!(untouched.bytes, object.bytes);

    let leftover: Vec<_> = std::fs::read_dir(scratch.path())
        .expect("read scratch")
        .collect();
    assert!(leftover.is_empty());
}
