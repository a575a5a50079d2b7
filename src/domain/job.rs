//! Render jobs and the artifact layout they produce.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::DomainError;

const GOAL_FILE_EXTENSION: &str = "bb";

/// Optimisation applied to the vector output and, at the highest level, to the
/// raster derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RasterOptimization {
    /// Browser screenshot, unoptimised SVG.
    #[default]
    None,
    /// Optimised SVG; raster still comes from the browser screenshot.
    Vector,
    /// Optimised SVG and a raster rendered from that SVG.
    VectorAndRaster,
}

impl RasterOptimization {
    pub fn level(self) -> u8 {
        match self {
            RasterOptimization::None => 0,
            RasterOptimization::Vector => 1,
            RasterOptimization::VectorAndRaster => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(RasterOptimization::None),
            1 => Some(RasterOptimization::Vector),
            2 => Some(RasterOptimization::VectorAndRaster),
            _ => None,
        }
    }

    pub fn optimizes_vector(self) -> bool {
        !matches!(self, RasterOptimization::None)
    }

    pub fn derives_raster(self) -> bool {
        matches!(self, RasterOptimization::VectorAndRaster)
    }
}

/// Goal identifier used as the base name of every input and output file.
///
/// Usually `user+goal`. Path separators and leading dots are rejected so a
/// slug can never address a file outside the configured directories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalSlug(String);

impl GoalSlug {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("slug must not be empty"));
        }
        if trimmed.starts_with('.') {
            return Err(DomainError::validation("slug must not start with `.`"));
        }
        if trimmed.contains(['/', '\\', '\0']) {
            return Err(DomainError::validation(
                "slug must not contain path separators",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn from_user_goal(user: &str, goal: &str) -> Result<Self, DomainError> {
        Self::parse(&format!("{}+{}", user.trim(), goal.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `user+goal` portion of the slug, dropping any further `+suffix`.
    pub fn short(&self) -> &str {
        let mut plus = self.0.match_indices('+').map(|(index, _)| index);
        match (plus.next(), plus.next()) {
            (Some(_), Some(second)) => &self.0[..second],
            _ => &self.0,
        }
    }
}

impl std::fmt::Display for GoalSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One request's worth of rendering work. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub request_id: u64,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub slug: GoalSlug,
    pub suppress_graph: bool,
    pub optimization: RasterOptimization,
    pub started_at: OffsetDateTime,
}

impl RenderJob {
    pub fn new(
        request_id: u64,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        slug: GoalSlug,
    ) -> Self {
        Self {
            request_id,
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            slug,
            suppress_graph: false,
            optimization: RasterOptimization::None,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_suppressed_graph(mut self, suppress: bool) -> Self {
        self.suppress_graph = suppress;
        self
    }

    pub fn with_optimization(mut self, optimization: RasterOptimization) -> Self {
        self.optimization = optimization;
        self
    }

    /// `<input_dir>/<slug>.bb`
    pub fn goal_file(&self) -> PathBuf {
        goal_file(&self.input_dir, &self.slug)
    }

    pub fn artifacts(&self) -> ArtifactPaths {
        ArtifactPaths::new(&self.output_dir, &self.slug)
    }
}

pub fn goal_file(input_dir: &Path, slug: &GoalSlug) -> PathBuf {
    input_dir.join(format!("{}.{GOAL_FILE_EXTENSION}", slug.as_str()))
}

/// Canonical output locations for a slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub json: PathBuf,
    pub svg: PathBuf,
    pub png: PathBuf,
    pub thumbnail: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, slug: &GoalSlug) -> Self {
        let slug = slug.as_str();
        Self {
            json: output_dir.join(format!("{slug}.json")),
            svg: output_dir.join(format!("{slug}.svg")),
            png: output_dir.join(format!("{slug}.png")),
            thumbnail: output_dir.join(format!("{slug}-thumb.png")),
        }
    }

    /// Files that only exist when a graph was generated.
    pub fn graph_files(&self) -> [&Path; 3] {
        [&self.svg, &self.png, &self.thumbnail]
    }
}
