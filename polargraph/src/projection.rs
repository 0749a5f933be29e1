//! `projection`
//!
//! Maps artwork from the space it was drawn in (image pixels, SVG user units)
//! onto the paper, the way the preview showed it when the job was started.

use lyon_algorithms::geom::euclid::{Point2D, Transform2D, Vector2D};
use serde::{Deserialize, Serialize};

use crate::{kinematics::CartesianPosition, machine::MachineConfig};

/// How many preview units are drawn per millimetre of paper.
pub const PAPER_PREVIEW_SCALE: f64 = 1.5;

/// Unit marker for the artwork's own coordinates.
#[derive(Debug, Clone, Copy)]
pub struct SourceSpace;

/// Unit marker for pen positions in mm.
#[derive(Debug, Clone, Copy)]
pub struct MachineSpace;

/// Affine map from artwork coordinates to pen positions.
pub type Projection = Transform2D<f64, SourceSpace, MachineSpace>;

/// Size of the canvas the artwork was drawn on, in its own units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceSize {
    /// Canvas width.
    pub width: f64,
    /// Canvas height.
    pub height: f64,
}

/// The pan and zoom of the preview, captured when the job was started.
///
/// The offset is in preview units, before zooming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewState {
    /// Zoom level, 1 is unzoomed.
    pub zoom_level: f64,
    /// Horizontal pan.
    pub offset_x: f64,
    /// Vertical pan.
    pub offset_y: f64,
}

impl Default for ViewState {
    fn default() -> Self {
        ViewState {
            zoom_level: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

/// Why a projection could not be built.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ProjectionError {
    /// The artwork canvas has no area.
    #[error("source canvas must have a positive size, got {width}x{height}")]
    InvalidSource {
        /// Canvas width.
        width: f64,
        /// Canvas height.
        height: f64,
    },
    /// The zoom level or pan is unusable.
    #[error("view zoom must be positive and the pan finite")]
    InvalidView,
}

/// Builds the map from artwork to paper.
///
/// The artwork is scaled to fit the preview of the paper, centred on the
/// machine's horizontal midpoint and the paper's vertical midpoint, panned and
/// zoomed as the preview was, then scaled from preview units back to mm.
///
/// # Arguments
/// * `source`: Size of the artwork canvas.
/// * `view`: The preview's pan and zoom.
/// * `config`: The machine, for the paper size.
///
/// # Returns
/// The projection.
///
/// # Errors
/// A [`ProjectionError`] if the canvas has no area or the view is unusable.
pub fn projection(
    source: SourceSize,
    view: ViewState,
    config: &MachineConfig,
) -> Result<Projection, ProjectionError> {
    if !(source.width.is_finite() && source.height.is_finite())
        || source.width <= 0.0
        || source.height <= 0.0
    {
        return Err(ProjectionError::InvalidSource {
            width: source.width,
            height: source.height,
        });
    }
    if !(view.zoom_level.is_finite() && view.offset_x.is_finite() && view.offset_y.is_finite())
        || view.zoom_level <= 0.0
    {
        return Err(ProjectionError::InvalidView);
    }

    let dimensions = config.dimensions();
    let preview_width = dimensions.paper_width * PAPER_PREVIEW_SCALE;
    let preview_height = dimensions.paper_height * PAPER_PREVIEW_SCALE;
    let fit = (preview_width / source.width).min(preview_height / source.height);

    Ok(Transform2D::scale(fit, fit)
        .then_translate(Vector2D::new(
            -source.width * fit / 2.0,
            -source.height * fit / 2.0,
        ))
        .then_translate(Vector2D::new(view.offset_x, view.offset_y))
        .then_scale(view.zoom_level, view.zoom_level)
        .then_translate(Vector2D::new(0.0, preview_height / 2.0))
        .then_scale(PAPER_PREVIEW_SCALE.recip(), PAPER_PREVIEW_SCALE.recip()))
}

/// Moves a point through a projection.
pub fn project(projection: &Projection, point: CartesianPosition) -> CartesianPosition {
    let projected = projection.transform_point(Point2D::new(point.x, point.y));
    CartesianPosition {
        x: projected.x,
        y: projected.y,
    }
}
