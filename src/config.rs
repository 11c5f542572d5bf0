//! Run configuration from a TOML file.
//!
//! Every table and key is optional; anything left out keeps its default.
//!
//! ```toml
//! progress-interval = 100
//!
//! [precision]
//! stage-a = "single"
//! stage-b = "double"
//!
//! [stage-a]
//! iterations = 1000
//! learning-rate = 1e-2
//!
//! [stage-b]
//! max-iterations = 2000
//! tolerance-grad = 1e-15
//! tolerance-change = 1e-15
//! line-search = "wolfe"        # or "more-thuente"
//!
//! [targets]                    # all five or none
//! h1111 = 99.5868945877107
//! h1133 = 4.00174342801634
//! h1313 = 7.67307316987048
//! h1212 = 33.0056387729023
//! h3333 = 1.78777067612793
//!
//! [seed]
//! e1 = 100.0
//! nu1 = 0.3
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{
    AdamOptions, CalibrationError, CalibrationOptions, CalibrationResult, MeasuredTargets,
    ModelParameters, PrecisionOptions, RefineOptions,
};

/// A fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// File this config was read from (for display).
    pub source: Option<PathBuf>,
    pub options: CalibrationOptions,
    pub targets: MeasuredTargets,
    pub seed: ModelParameters<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            options: CalibrationOptions::default(),
            targets: MeasuredTargets::reference(),
            seed: ModelParameters::seed(),
        }
    }
}

/// Raw config as deserialized from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    precision: PrecisionOptions,
    stage_a: AdamOptions,
    stage_b: RefineOptions,
    progress_interval: Option<usize>,
    targets: Option<BTreeMap<String, f64>>,
    seed: Option<RawSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSeed {
    e1: f64,
    nu1: f64,
    e2: f64,
    nu2: f64,
    d1: f64,
}

impl Default for RawSeed {
    fn default() -> Self {
        let p = ModelParameters::<f64>::seed();
        Self { e1: p.e1, nu1: p.nu1, e2: p.e2, nu2: p.nu2, d1: p.d1 }
    }
}

impl Config {
    /// Read and resolve `path`.
    pub fn load(path: &Path) -> CalibrationResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CalibrationError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text, path)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Resolve TOML text; `origin` only labels parse errors.
    pub fn parse(text: &str, origin: &Path) -> CalibrationResult<Self> {
        let raw: RawConfig = toml::from_str(text).map_err(|source| CalibrationError::ConfigParse {
            path: origin.to_path_buf(),
            source,
        })?;

        let mut options = CalibrationOptions {
            precision: raw.precision,
            stage_a: raw.stage_a,
            stage_b: raw.stage_b,
            ..CalibrationOptions::default()
        };
        if let Some(interval) = raw.progress_interval {
            options.progress_interval = interval;
        }
        options.validate()?;

        let targets = match raw.targets {
            Some(map) => MeasuredTargets::from_map(&map)?,
            None => MeasuredTargets::reference(),
        };
        let seed = raw
            .seed
            .map(|s| ModelParameters::new(s.e1, s.nu1, s.e2, s.nu2, s.d1))
            .unwrap_or_else(ModelParameters::seed);

        Ok(Self { source: None, options, targets, seed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::PrecisionKind;
    use crate::types::{Coefficient, LineSearch};
    use std::io::Write;

    fn inline(text: &str) -> CalibrationResult<Config> {
        Config::parse(text, Path::new("<inline>"))
    }

    #[test]
    fn empty_file_gives_defaults() {
        let c = inline("").unwrap();
        assert_eq!(c.options, CalibrationOptions::default());
        assert_eq!(c.targets, MeasuredTargets::reference());
        assert_eq!(c.seed, ModelParameters::seed());
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let c = inline(
            r#"
            progress-interval = 25

            [precision]
            stage-a = "double"

            [stage-a]
            iterations = 300

            [stage-b]
            line-search = "more-thuente"
            history-size = 20

            [seed]
            d1 = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(c.options.progress_interval, 25);
        assert_eq!(c.options.precision.stage_a, PrecisionKind::Double);
        assert_eq!(c.options.precision.stage_b, PrecisionKind::Double);
        assert_eq!(c.options.stage_a.iterations, 300);
        assert_eq!(c.options.stage_a.learning_rate, 1e-2);
        assert_eq!(c.options.stage_b.line_search, LineSearch::MoreThuente);
        assert_eq!(c.options.stage_b.history_size, 20);
        assert_eq!(c.options.stage_b.max_iterations, 2000);
        assert_eq!(c.seed.d1, 0.4);
        assert_eq!(c.seed.e1, 100.0);
    }

    #[test]
    fn targets_table_must_be_complete() {
        let err = inline("[targets]\nh1111 = 1.0\nh1133 = 2.0\n").unwrap_err();
        assert!(matches!(err, CalibrationError::MissingCoefficient(_)), "{err}");

        let c = inline(
            "[targets]\nh1111 = 1.0\nh1133 = 2.0\nh1313 = 3.0\nh1212 = 4.0\nh3333 = 5.0\n",
        )
        .unwrap();
        assert_eq!(c.targets.get(Coefficient::H1212), 4.0);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let err = inline("[stage-a]\nlearnign-rate = 0.1\n").unwrap_err();
        assert!(matches!(err, CalibrationError::ConfigParse { .. }), "{err}");
        assert!(err.to_string().contains("<inline>"));

        let err = inline("[precision]\nstage-a = \"half\"\n").unwrap_err();
        assert!(matches!(err, CalibrationError::ConfigParse { .. }), "{err}");

        let err = inline("[precision]\nstage-a = \"double\"\nstage-b = \"single\"\n").unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidConfig(_)), "{err}");

        let err = inline("[targets]\nh1111 = 0.0\nh1133 = 2.0\nh1313 = 3.0\nh1212 = 4.0\nh3333 = 5.0\n")
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidTarget { .. }), "{err}");
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[stage-b]\nmax-iterations = 50").unwrap();
        let c = Config::load(file.path()).unwrap();
        assert_eq!(c.options.stage_b.max_iterations, 50);
        assert_eq!(c.source.as_deref(), Some(file.path()));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, CalibrationError::ConfigIo { .. }), "{err}");
    }
}
