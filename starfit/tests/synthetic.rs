//! End-to-end pipeline tests on synthetic star fields.

use std::collections::HashMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use starfit::{
    detect, export_csv, fit_models, resolve_scale, AstrometricSolution, DetectorConfig, Frame,
    PsfFunction, PsfOptions, ScaleMode, SortingCriterion, StarCollection,
};

struct SyntheticStar {
    cx: f64,
    cy: f64,
    sigma: f64,
    amplitude: f64,
}

fn render(
    width: usize,
    height: usize,
    background: f64,
    stars: &[SyntheticStar],
    noise: f64,
    seed: u64,
) -> Frame {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pixels = Array2::from_shape_fn((height, width), |(r, c)| {
        let mut v = background;
        for star in stars {
            let dx = c as f64 - star.cx;
            let dy = r as f64 - star.cy;
            v += star.amplitude
                * (-(dx * dx + dy * dy) / (2.0 * star.sigma * star.sigma)).exp();
        }
        v
    });
    if noise > 0.0 {
        for v in pixels.iter_mut() {
            *v += (rng.random::<f64>() - 0.5) * 2.0 * noise;
        }
    }
    Frame::from_array(pixels)
}

#[test]
fn detect_and_fit_clean_gaussian() {
    let frame = render(
        64,
        64,
        0.1,
        &[SyntheticStar {
            cx: 32.3,
            cy: 31.7,
            sigma: 2.0,
            amplitude: 0.8,
        }],
        0.0,
        0,
    );

    let det = detect(&frame, 0, 32.0, 32.0, &DetectorConfig::default());
    assert!(det.is_detected());
    assert_relative_eq!(det.x, 32.3, epsilon = 0.01);
    assert_relative_eq!(det.y, 31.7, epsilon = 0.01);

    let psfs = fit_models(&frame, 0, &det, &PsfOptions::default());
    assert_eq!(psfs.len(), 1);
    let psf = &psfs[0];
    assert!(psf.is_fitted());
    assert_relative_eq!(psf.cx, 32.3, epsilon = 0.01);
    assert_relative_eq!(psf.cy, 31.7, epsilon = 0.01);
    assert_relative_eq!(psf.b, 0.1, epsilon = 1e-3);
    assert_relative_eq!(psf.a, 0.8, epsilon = 1e-3);
    assert!(psf.mad < 1e-3);
}

#[test]
fn detect_and_fit_with_noise() {
    let frame = render(
        64,
        64,
        0.1,
        &[SyntheticStar {
            cx: 30.4,
            cy: 33.6,
            sigma: 1.8,
            amplitude: 0.7,
        }],
        0.005,
        42,
    );

    let det = detect(&frame, 0, 31.0, 33.0, &DetectorConfig::default());
    assert!(det.is_detected(), "status = {:?}", det.status);
    assert_relative_eq!(det.x, 30.4, epsilon = 0.1);
    assert_relative_eq!(det.y, 33.6, epsilon = 0.1);

    let psfs = fit_models(&frame, 0, &det, &PsfOptions::default());
    let psf = &psfs[0];
    assert!(psf.is_fitted());
    assert_relative_eq!(psf.cx, 30.4, epsilon = 0.05);
    assert_relative_eq!(psf.cy, 33.6, epsilon = 0.05);
    assert_relative_eq!(psf.sx, 1.8, epsilon = 0.1);
}

#[test]
fn collection_pipeline_with_export() {
    let stars = [
        SyntheticStar {
            cx: 16.0,
            cy: 16.0,
            sigma: 1.6,
            amplitude: 0.8,
        },
        SyntheticStar {
            cx: 48.0,
            cy: 16.0,
            sigma: 2.2,
            amplitude: 0.5,
        },
        SyntheticStar {
            cx: 32.0,
            cy: 48.0,
            sigma: 1.9,
            amplitude: 0.3,
        },
    ];
    let frame = render(64, 64, 0.08, &stars, 0.002, 7);

    let mut coll = StarCollection::new("synthetic_field");
    let detector = DetectorConfig::default();
    let options = PsfOptions::default();
    for star in &stars {
        let id = coll.add_star(&frame, 0, star.cx + 0.4, star.cy - 0.3, &detector, &options);
        assert!(id.is_some());
    }
    assert_eq!(coll.len(), 3);

    // Faintest star first under ascending amplitude
    coll.sort_stars(SortingCriterion::Amplitude, true);
    assert_eq!(coll.stars()[0].id, 3);
    coll.sort_stars(SortingCriterion::Id, true);

    // Angular scale from standard acquisition keywords
    let keywords: HashMap<String, f64> =
        [("FOCALLEN".to_string(), 530.0), ("XPIXSZ".to_string(), 3.76)]
            .into_iter()
            .collect();
    let (xs, ys) = resolve_scale(&ScaleMode::StandardKeywords, &keywords).unwrap();
    assert!(xs > 0.0);
    coll.set_scale(xs, ys);

    let mut buf = Vec::new();
    export_csv(&mut buf, &coll, true).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    for line in &lines {
        assert_eq!(line.split(',').count(), 17);
    }
    assert!(lines[1].starts_with("synthetic_field,1,0,"));
    assert!(lines[1].split(',').nth(12) == Some("\""));
}

#[test]
fn recalculate_tracks_a_shifted_field() {
    let star = |cx, cy| SyntheticStar {
        cx,
        cy,
        sigma: 1.8,
        amplitude: 0.7,
    };
    let before = render(64, 64, 0.1, &[star(24.0, 24.0), star(44.0, 40.0)], 0.0, 1);
    let after = render(64, 64, 0.1, &[star(25.2, 24.8), star(45.2, 40.8)], 0.0, 1);

    let mut coll = StarCollection::new("v");
    let detector = DetectorConfig::default();
    let options = PsfOptions::default();
    coll.add_star(&before, 0, 24.0, 24.0, &detector, &options)
        .unwrap();
    coll.add_star(&before, 0, 44.0, 40.0, &detector, &options)
        .unwrap();

    coll.recalculate(&after, &detector);
    let s1 = coll.star(1).unwrap();
    assert!(s1.is_detected());
    assert_relative_eq!(s1.x(), 25.2, epsilon = 0.05);
    assert_relative_eq!(s1.psfs[0].cx, 25.2, epsilon = 0.05);
    let s2 = coll.star(2).unwrap();
    assert_relative_eq!(s2.y(), 40.8, epsilon = 0.05);
}

#[test]
fn recalculate_is_idempotent_on_unchanged_data() {
    let frame = render(
        64,
        64,
        0.1,
        &[SyntheticStar {
            cx: 32.3,
            cy: 31.7,
            sigma: 2.0,
            amplitude: 0.8,
        }],
        0.003,
        11,
    );

    let mut coll = StarCollection::new("v");
    let detector = DetectorConfig::default();
    coll.add_star(&frame, 0, 32.0, 32.0, &detector, &PsfOptions::default())
        .unwrap();

    coll.recalculate(&frame, &detector);
    let first: Vec<_> = coll
        .stars()
        .iter()
        .map(|s| (s.x(), s.y(), s.detection.rect, s.psfs.clone()))
        .collect();

    coll.recalculate(&frame, &detector);
    let second: Vec<_> = coll
        .stars()
        .iter()
        .map(|s| (s.x(), s.y(), s.detection.rect, s.psfs.clone()))
        .collect();

    assert_eq!(first, second);
}

#[test]
fn auto_selection_prefers_moffat_on_heavy_wings() {
    // A Moffat profile has heavier wings than any Gaussian can reproduce
    let pixels = Array2::from_shape_fn((64, 64), |(r, c)| {
        let dx = c as f64 - 32.0;
        let dy = r as f64 - 32.0;
        let q = (dx * dx + dy * dy) / 4.0;
        0.1 + 0.8 * (1.0 + q).powi(-4)
    });
    let frame = Frame::from_array(pixels);

    let det = detect(&frame, 0, 32.0, 32.0, &DetectorConfig::default());
    assert!(det.is_detected());

    let psfs = fit_models(&frame, 0, &det, &PsfOptions::default());
    assert_eq!(psfs.len(), 1);
    assert!(psfs[0].is_fitted());
    assert!(psfs[0].function.is_moffat(), "chose {}", psfs[0].function);
}

#[test]
fn averaging_over_a_field() {
    let stars: Vec<SyntheticStar> = (0..4)
        .map(|i| SyntheticStar {
            cx: 16.0 + 24.0 * f64::from(i % 2),
            cy: 16.0 + 24.0 * f64::from(i / 2),
            sigma: 2.0,
            amplitude: 0.6,
        })
        .collect();
    let frame = render(64, 64, 0.1, &stars, 0.0, 3);

    let mut coll = StarCollection::new("v");
    let options = PsfOptions {
        auto_psf: false,
        ..PsfOptions::default()
    };
    let mut ids = Vec::new();
    for star in &stars {
        ids.push(
            coll.add_star(&frame, 0, star.cx, star.cy, &DetectorConfig::default(), &options)
                .unwrap(),
        );
    }

    let avg = coll.average_psfs(&ids).unwrap();
    assert_eq!(avg.function, PsfFunction::Gaussian);
    assert_eq!(avg.n, 4);
    assert_relative_eq!(avg.sx, 2.0, epsilon = 0.05);
    assert_relative_eq!(avg.b, 0.1, epsilon = 0.01);
    assert_relative_eq!(avg.fwhm_x, 2.354_820_045 * avg.sx, epsilon = 1e-9);
}

#[test]
fn astrometric_positions_follow_fits() {
    struct LinearWcs;
    impl AstrometricSolution for LinearWcs {
        fn image_to_celestial(&self, x: f64, y: f64) -> Option<(f64, f64)> {
            Some((83.8 + (x - 32.0) * 1e-4, -5.4 - (y - 32.0) * 1e-4))
        }
    }

    let frame = render(
        64,
        64,
        0.1,
        &[SyntheticStar {
            cx: 32.0,
            cy: 32.0,
            sigma: 2.0,
            amplitude: 0.8,
        }],
        0.0,
        0,
    );

    let mut coll = StarCollection::new("m42");
    coll.set_astrometry(Some(Arc::new(LinearWcs)));
    coll.add_star(
        &frame,
        0,
        32.0,
        32.0,
        &DetectorConfig::default(),
        &PsfOptions::default(),
    )
    .unwrap();

    let (ra, dec) = coll.star(1).unwrap().psfs[0].q0.unwrap();
    assert_relative_eq!(ra, 83.8, epsilon = 1e-4);
    assert_relative_eq!(dec, -5.4, epsilon = 1e-4);
}
