use regex_lite::Regex;
use thiserror::Error;

const SHARED_PRESET_PARAMS: [&str; 14] = [
    "-filter Triangle",
    "-define filter:support=2",
    "-unsharp 0.25x0.25+8+0.065",
    "-dither None",
    "-posterize 136",
    "-quality 82",
    "-define jpeg:fancy-upsampling=off",
    "-define png:compression-filter=5",
    "-define png:compression-level=9",
    "-define png:compression-strategy=1",
    "-define png:exclude-chunk=all",
    "-interlace none",
    "-colorspace sRGB",
    "-strip",
];

const LARGE_EXTRA_PARAMS: [&str; 4] = [
    "-resize 500x500",
    "-gravity center",
    "-extent 500x500",
    "-fill white",
];

const DYNAMIC_SIZE_PARAMS: [&str; 8] = [
    "-strip",
    "-sampling-factor 4:2:0",
    "-colorspace RGB",
    "-interlace none",
    "-gravity center",
    "-fill white",
    "-quality 85",
    "-format jpg",
];

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transformation {0} not found")]
    NotFound(String),
    #[error("transformation {name} does not match {kind:?} pattern {pattern}")]
    PatternMismatch {
        kind: TransformationKind,
        pattern: String,
        name: String,
    },
    #[error("invalid transformation pattern {pattern}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex_lite::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationKind {
    /// Copies the source unchanged.
    Passthrough,
    Large,
    /// One captured width, e.g. `thumb-100`.
    Thumbnail,
    /// Captured width and height, e.g. `w-320-h-240`.
    DynamicSize,
}

impl TransformationKind {
    pub fn default_pattern(self) -> &'static str {
        match self {
            TransformationKind::Passthrough => "source",
            TransformationKind::Large => "large",
            TransformationKind::Thumbnail => r"thumb-(\d+)",
            TransformationKind::DynamicSize => r"w-(\d+)-h-(\d+)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformationSpec {
    kind: TransformationKind,
    pattern: String,
    matcher: Regex,
}

impl TransformationSpec {
    /// Patterns match case-insensitively anywhere in the transformation name.
    pub fn new(kind: TransformationKind, pattern: &str) -> Result<Self, TransformError> {
        let matcher =
            Regex::new(&format!("(?i){pattern}")).map_err(|source| TransformError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            kind,
            pattern: pattern.to_string(),
            matcher,
        })
    }

    pub fn builtin(kind: TransformationKind) -> Result<Self, TransformError> {
        Self::new(kind, kind.default_pattern())
    }

    pub fn kind(&self) -> TransformationKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }

    /// Processor parameters for `name`. An empty list means pass-through.
    /// Parametrized kinds re-run their own match, so a name the registry
    /// routed here by mistake is reported rather than half-applied.
    pub fn params(&self, name: &str) -> Result<Vec<String>, TransformError> {
        match self.kind {
            TransformationKind::Passthrough => Ok(Vec::new()),
            TransformationKind::Large => Ok(SHARED_PRESET_PARAMS
                .iter()
                .chain(LARGE_EXTRA_PARAMS.iter())
                .map(|param| param.to_string())
                .collect()),
            TransformationKind::Thumbnail => {
                let [width] = self.captured_dimensions::<1>(name)?;
                let mut params: Vec<String> = SHARED_PRESET_PARAMS
                    .iter()
                    .map(|param| param.to_string())
                    .collect();
                params.push(format!("-thumbnail {width}"));
                Ok(params)
            }
            TransformationKind::DynamicSize => {
                let [width, height] = self.captured_dimensions::<2>(name)?;
                let mut params: Vec<String> = DYNAMIC_SIZE_PARAMS
                    .iter()
                    .map(|param| param.to_string())
                    .collect();
                params.push(format!("-resize {width}x{height}"));
                params.push(format!("-extent {width}x{height}"));
                Ok(params)
            }
        }
    }

    /// Captured digit groups, passed through as written (`thumb-007` keeps
    /// `007`).
    fn captured_dimensions<'a, const N: usize>(
        &self,
        name: &'a str,
    ) -> Result<[&'a str; N], TransformError> {
        let mismatch = || TransformError::PatternMismatch {
            kind: self.kind,
            pattern: self.pattern.clone(),
            name: name.to_string(),
        };
        let captures = self.matcher.captures(name).ok_or_else(mismatch)?;
        let mut values = [""; N];
        for (index, value) in values.iter_mut().enumerate() {
            *value = captures
                .get(index + 1)
                .map(|group| group.as_str())
                .filter(|digits| !digits.is_empty())
                .ok_or_else(mismatch)?;
        }
        Ok(values)
    }
}

/// Ordered list of transformation specs; the first registered match wins.
#[derive(Debug, Clone, Default)]
pub struct TransformationRegistry {
    specs: Vec<TransformationSpec>,
}

impl TransformationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Result<Self, TransformError> {
        let mut registry = Self::new();
        for kind in [
            TransformationKind::Passthrough,
            TransformationKind::Large,
            TransformationKind::Thumbnail,
            TransformationKind::DynamicSize,
        ] {
            registry.register(TransformationSpec::builtin(kind)?);
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: TransformationSpec) {
        self.specs.push(spec);
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn resolve(&self, name: &str) -> Result<&TransformationSpec, TransformError> {
        self.specs
            .iter()
            .find(|spec| spec.matches(name))
            .ok_or_else(|| TransformError::NotFound(name.to_string()))
    }
}
