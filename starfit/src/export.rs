//! CSV export of fitted PSF parameters.
//!
//! One row per converged PSF, one header row, written to any `io::Write`.
//! FWHM columns switch from pixels to arcseconds when the owning collection
//! carries a positive angular scale on both axes.

use std::io::{self, Write};

use crate::collection::StarCollection;

const CSV_HEADER: &str =
    "ViewId,StarId,Channel,Function,B,A,cx,cy,sx,sy,FWHMx,FWHMy,unit,r,theta,beta,MAD";

/// Write the collection's fitted PSFs as CSV.
///
/// Stars without any converged PSF contribute no rows. With `signed_angles`
/// set, rotation angles above 90 degrees are written as `theta - 180`.
///
/// # Errors
/// Propagates write failures from the sink.
pub fn export_csv<W: Write>(
    sink: &mut W,
    collection: &StarCollection,
    signed_angles: bool,
) -> io::Result<()> {
    let (x_scale, y_scale) = collection.scale();
    let angular = x_scale > 0.0 && y_scale > 0.0;
    let (fx, fy, unit) = if angular {
        (x_scale, y_scale, "\"")
    } else {
        (1.0, 1.0, "px")
    };

    writeln!(sink, "{CSV_HEADER}")?;
    for star in collection.stars() {
        for psf in star.psfs.iter().filter(|p| p.is_fitted()) {
            writeln!(
                sink,
                "{},{},{},{},{:.6},{:.6},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{},{:.3},{:.2},{:.2},{:.3e}",
                collection.view_id,
                star.id,
                star.detection.channel,
                psf.function,
                psf.b,
                psf.a,
                psf.cx,
                psf.cy,
                psf.sx,
                psf.sy,
                fx * psf.fwhm_x(),
                fy * psf.fwhm_y(),
                unit,
                psf.aspect_ratio(),
                psf.display_theta(signed_angles),
                psf.beta,
                psf.mad,
            )?;
        }
    }
    Ok(())
}
