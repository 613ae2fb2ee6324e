//! Adaptive grid layout for participant cards
//!
//! Given a participant count and a viewport, pick the column count that
//! shows every card without scrolling while covering as much of the screen
//! with squarish cards as possible. Layouts are recomputed from scratch on
//! every count or viewport change; nothing is patched incrementally.
//!
//! When no candidate fits, the engine degrades to a scrolling flow layout
//! of fixed-size cards and says so in its result.

use serde::{Deserialize, Serialize};

/// Fixed geometry of the dashboard around the card grid, in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Width taken by side padding.
    pub horizontal_chrome: f64,
    /// Height taken by the header, stats bar and padding.
    pub vertical_chrome: f64,
    /// Gap between cards in both directions.
    pub gap: f64,
    pub min_card_width: f64,
    pub min_card_height: f64,
    /// Largest column count considered.
    pub max_columns: u32,
    /// Card size used by the scrolling fallback.
    pub flow_card_size: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            horizontal_chrome: 64.0,
            vertical_chrome: 180.0,
            gap: 24.0,
            min_card_width: 200.0,
            min_card_height: 200.0,
            max_columns: 6,
            flow_card_size: 300.0,
        }
    }
}

/// Viewport size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1920.0, 1080.0)
    }
}

/// A concrete column/row arrangement and the per-card size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfiguration {
    pub columns: u32,
    pub rows: u32,
    pub card_width: f64,
    pub card_height: f64,
}

impl GridConfiguration {
    /// Number of card slots.
    pub fn capacity(&self) -> u32 {
        self.columns * self.rows
    }
}

/// Outcome of a layout computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridLayout {
    /// No participants to show.
    Empty,
    /// Every card is visible without scrolling.
    Fitted {
        grid: GridConfiguration,
        score: f64,
    },
    /// No candidate fits; fixed-size cards in a scrolling flow.
    Flow { grid: GridConfiguration },
}

impl GridLayout {
    pub fn grid(&self) -> Option<&GridConfiguration> {
        match self {
            GridLayout::Empty => None,
            GridLayout::Fitted { grid, .. } | GridLayout::Flow { grid } => Some(grid),
        }
    }

    pub fn requires_scrolling(&self) -> bool {
        matches!(self, GridLayout::Flow { .. })
    }
}

/// Evaluate one candidate column count. Returns the configuration and its
/// score if every card fits at or above the minimum size.
fn evaluate(
    participants: u32,
    columns: u32,
    available_width: f64,
    available_height: f64,
    config: &LayoutConfig,
) -> Option<(GridConfiguration, f64)> {
    let rows = participants.div_ceil(columns);
    let card_width = (available_width - config.gap * (columns - 1) as f64) / columns as f64;
    let card_height = (available_height - config.gap * (rows - 1) as f64) / rows as f64;

    if card_width < config.min_card_width || card_height < config.min_card_height {
        return None;
    }
    let total_height = card_height * rows as f64 + config.gap * (rows - 1) as f64;
    if total_height > available_height + f64::EPSILON * available_height.abs().max(1.0) {
        return None;
    }

    let squareness = card_width.min(card_height) / card_width.max(card_height);
    let coverage =
        (card_width * card_height * participants as f64) / (available_width * available_height);

    Some((
        GridConfiguration {
            columns,
            rows,
            card_width,
            card_height,
        },
        squareness * coverage,
    ))
}

/// Scrolling fallback: fixed minimum card size, as many columns as fit.
fn flow_layout(participants: u32, available_width: f64, config: &LayoutConfig) -> GridConfiguration {
    let size = config.flow_card_size;
    let fit = ((available_width + config.gap) / (size + config.gap)).floor();
    let columns = if fit.is_finite() && fit >= 1.0 {
        (fit as u32).min(participants).max(1)
    } else {
        1
    };
    let rows = participants.div_ceil(columns);
    let card_width = ((available_width - config.gap * (columns - 1) as f64) / columns as f64).max(size);

    GridConfiguration {
        columns,
        rows,
        card_width,
        card_height: size,
    }
}

/// Choose the grid for `participants` cards in the given viewport.
pub fn compute_grid(participants: usize, viewport: Viewport, config: &LayoutConfig) -> GridLayout {
    if participants == 0 {
        return GridLayout::Empty;
    }
    let participants = participants.min(u32::MAX as usize) as u32;

    let available_width = viewport.width - config.horizontal_chrome;
    let available_height = viewport.height - config.vertical_chrome;

    let mut best: Option<(GridConfiguration, f64)> = None;
    if available_width > 0.0 && available_height > 0.0 {
        // More columns than cards only leaves empty slots.
        let max_columns = config.max_columns.max(1).min(participants);
        for columns in 1..=max_columns {
            if let Some((grid, score)) =
                evaluate(participants, columns, available_width, available_height, config)
            {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((grid, score));
                }
            }
        }
    }

    match best {
        Some((grid, score)) => GridLayout::Fitted { grid, score },
        None => {
            log::warn!(
                "Cannot fit {} cards in {}x{} without scrolling, using flow layout",
                participants,
                viewport.width,
                viewport.height
            );
            GridLayout::Flow {
                grid: flow_layout(participants, available_width.max(0.0), config),
            }
        }
    }
}
