mod common;

use std::io::Cursor;
use std::time::{Duration, Instant};

use common::png_frame;
use printcast::capture::apply_image_transformations;
use printcast::error::CaptureError;
use printcast::{FrameSource, SnapshotFetcher};

/// 1x2 PNG, red on top, blue at the bottom.
fn two_tone_png() -> Vec<u8> {
    let mut img = image::RgbImage::new(1, 2);
    img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
    img.put_pixel(0, 1, image::Rgb([0, 0, 255]));
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .expect("encode png");
    buffer
}

#[test]
fn test_image_transformations() {
    let image_bytes = png_frame();
    let not_flipped =
        apply_image_transformations(&image_bytes, false).expect("No flip failed");
    assert_eq!(not_flipped, image_bytes);

    let flipped = apply_image_transformations(&two_tone_png(), true).expect("Flip failed");
    assert_eq!(
        image::guess_format(&flipped).expect("format"),
        image::ImageFormat::Png
    );
    let decoded = image::load_from_memory(&flipped).expect("decode").to_rgb8();
    assert_eq!(decoded.get_pixel(0, 0), &image::Rgb([0, 0, 255]));
    assert_eq!(decoded.get_pixel(0, 1), &image::Rgb([255, 0, 0]));
}

#[test]
fn test_flip_rejects_non_image() {
    let result = apply_image_transformations(b"<html>502 Bad Gateway</html>", true);
    assert!(matches!(result, Err(CaptureError::Transform(_))));
}

#[test]
fn test_no_sources_configured() {
    let fetcher = SnapshotFetcher::new(Vec::new(), false, Duration::from_millis(200));
    assert!(fetcher.image_urls().is_empty());
    assert!(matches!(fetcher.fetch_frame(), Err(CaptureError::NoSources)));
}

#[test]
fn test_unreachable_camera_fails_each_attempt() {
    let urls = vec![
        "http://127.0.0.1:9/snapshot-a".to_string(),
        "http://127.0.0.1:9/snapshot-b".to_string(),
    ];
    let fetcher = SnapshotFetcher::new(urls.clone(), false, Duration::from_millis(500));
    assert_eq!(fetcher.image_urls(), urls.as_slice());

    // Round-robin: consecutive single fetches hit different URLs.
    let first = fetcher.fetch_frame().expect_err("camera is down");
    let second = fetcher.fetch_frame().expect_err("camera is down");
    let failed_url = |e: &CaptureError| match e {
        CaptureError::Request { url, .. } => url.clone(),
        other => panic!("expected request error, got {:?}", other),
    };
    assert_eq!(failed_url(&first), urls[0]);
    assert_eq!(failed_url(&second), urls[1]);

    let started = Instant::now();
    let result = fetcher.fetch_with_retry(3, Duration::from_millis(10));
    assert!(matches!(
        result,
        Err(CaptureError::RetriesExhausted { attempts: 3 })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}
