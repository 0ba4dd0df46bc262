//! Detection tables for the extractor.
//!
//! Pure data: language markers, per-language framework indicator lists,
//! error signatures, and topic keyword sets. Tests inject synthetic
//! libraries through [`PatternLibrary::new`].

use lazy_static::lazy_static;
use regex::Regex;

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn regexes(items: &[&str]) -> Vec<Regex> {
    items
        .iter()
        .map(|p| Regex::new(p).expect("built-in pattern must compile"))
        .collect()
}

/// Indicator list for one framework under a language.
#[derive(Debug, Clone)]
pub struct FrameworkPattern {
    pub name: String,
    pub indicators: Vec<String>,
}

impl FrameworkPattern {
    pub fn new(name: &str, indicators: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            indicators: strs(indicators),
        }
    }
}

/// Markers for one language. `markers` are strong mentions scored like
/// extension hits (the language's own name and its file extensions);
/// `keywords` are weaker vocabulary; `patterns` match code shapes.
#[derive(Debug, Clone)]
pub struct LanguagePattern {
    pub name: String,
    pub keywords: Vec<String>,
    pub patterns: Vec<Regex>,
    pub markers: Vec<String>,
    pub frameworks: Vec<FrameworkPattern>,
}

/// A typed error signature with a salience weight.
#[derive(Debug, Clone)]
pub struct ErrorSignature {
    pub error_type: String,
    pub pattern: Regex,
    pub importance: f64,
}

impl ErrorSignature {
    pub fn new(error_type: &str, pattern: &str, importance: f64) -> Self {
        Self {
            error_type: error_type.to_string(),
            pattern: Regex::new(pattern).expect("built-in signature must compile"),
            importance,
        }
    }
}

/// Keyword set for one topic.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    pub name: String,
    pub keywords: Vec<String>,
}

impl TopicPattern {
    pub fn new(name: &str, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: strs(keywords),
        }
    }
}

/// The complete injectable detection table set.
#[derive(Debug, Clone)]
pub struct PatternLibrary {
    pub languages: Vec<LanguagePattern>,
    pub errors: Vec<ErrorSignature>,
    pub topics: Vec<TopicPattern>,
}

impl PatternLibrary {
    pub fn new(
        languages: Vec<LanguagePattern>,
        errors: Vec<ErrorSignature>,
        topics: Vec<TopicPattern>,
    ) -> Self {
        Self {
            languages,
            errors,
            topics,
        }
    }

    /// Map a file extension (with leading dot) to a language name.
    pub fn language_for_extension(&self, ext: &str) -> Option<&str> {
        let ext = ext.to_lowercase();
        self.languages
            .iter()
            .find(|lang| lang.markers.iter().any(|m| m == &ext))
            .map(|lang| lang.name.as_str())
    }

    pub fn language(&self, name: &str) -> Option<&LanguagePattern> {
        self.languages.iter().find(|l| l.name == name)
    }
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            errors: default_errors(),
            topics: default_topics(),
        }
    }
}

lazy_static! {
    /// Shared default library; compiled once per process.
    pub static ref DEFAULT_LIBRARY: PatternLibrary = PatternLibrary::default();
}

fn default_languages() -> Vec<LanguagePattern> {
    vec![
        LanguagePattern {
            name: "python".into(),
            keywords: strs(&[
                "python", "pip", "pytest", "virtualenv", "pandas", "numpy", "django", "flask",
                "fastapi",
            ]),
            patterns: regexes(&[
                r"(?i)\bpython3?\b",
                r"\bdef \w+\(",
                r"\bimport \w+",
                r"\bself\.",
                r"print\(",
                r"__init__",
            ]),
            markers: strs(&["python", ".py", ".ipynb"]),
            frameworks: vec![
                FrameworkPattern::new(
                    "django",
                    &["django", "models.py", "manage.py", "settings.py", "django.db"],
                ),
                FrameworkPattern::new(
                    "flask",
                    &["flask", "@app.route", "flask(__name__)", "blueprint"],
                ),
                FrameworkPattern::new(
                    "fastapi",
                    &["fastapi", "@app.get", "pydantic", "uvicorn"],
                ),
            ],
        },
        LanguagePattern {
            name: "javascript".into(),
            keywords: strs(&[
                "javascript", "npm", "node", "nodejs", "yarn", "webpack", "eslint",
            ]),
            patterns: regexes(&[
                r"(?i)\bjavascript\b",
                r"\bconst \w+",
                r"\blet \w+",
                r"=>",
                r"\bfunction \w+\(",
                r"console\.log",
                r"require\(",
            ]),
            markers: strs(&["javascript", ".js", ".jsx", ".mjs"]),
            frameworks: vec![
                FrameworkPattern::new(
                    "react",
                    &["react", "usestate", "useeffect", "jsx", "component", "props"],
                ),
                FrameworkPattern::new("vue", &["vue", "v-if", "v-for", "v-model", "computed"]),
                FrameworkPattern::new(
                    "express",
                    &["express", "app.get(", "app.post(", "middleware", "req, res"],
                ),
                FrameworkPattern::new(
                    "next",
                    &["next.js", "nextjs", "getserversideprops", "getstaticprops"],
                ),
            ],
        },
        LanguagePattern {
            name: "typescript".into(),
            keywords: strs(&["typescript", "tsc", "tsconfig", "ts-node"]),
            patterns: regexes(&[
                r"(?i)\btypescript\b",
                r"\binterface \w+",
                r": string\b",
                r": number\b",
                r"\btype \w+ =",
                r"<\w+>\(",
            ]),
            markers: strs(&["typescript", ".ts", ".tsx"]),
            frameworks: vec![
                FrameworkPattern::new(
                    "angular",
                    &["angular", "@component", "ngmodule", "ngoninit"],
                ),
                FrameworkPattern::new(
                    "nest",
                    &["nestjs", "@injectable", "@controller", "@module"],
                ),
            ],
        },
        LanguagePattern {
            name: "rust".into(),
            keywords: strs(&["rust", "cargo", "rustc", "crate", "borrow checker", "clippy"]),
            patterns: regexes(&[
                r"(?i)\brust\b",
                r"\bfn \w+\(",
                r"\blet mut ",
                r"\bimpl \w+",
                r"\bmatch \w+",
                r"&mut ",
                r"\bResult<",
            ]),
            markers: strs(&["rust", ".rs"]),
            frameworks: vec![
                FrameworkPattern::new("axum", &["axum", "router::new", "into_response"]),
                FrameworkPattern::new("actix", &["actix", "httpserver", "actix_web"]),
                FrameworkPattern::new("tokio", &["tokio", "async fn", ".await", "#[tokio::main]"]),
            ],
        },
        LanguagePattern {
            name: "go".into(),
            keywords: strs(&["golang", "go mod", "goroutine", "gofmt"]),
            patterns: regexes(&[
                r"(?i)\bgolang\b",
                r"\bfunc \w+\(",
                r":=",
                r"\bgo func\b",
                r"\bpackage \w+",
                r"\bchan \w+",
            ]),
            markers: strs(&["golang", ".go"]),
            frameworks: vec![
                FrameworkPattern::new("gin", &["gin", "gin.default", "gin.context"]),
                FrameworkPattern::new("echo", &["echo.new", "echo.context"]),
            ],
        },
        LanguagePattern {
            name: "java".into(),
            keywords: strs(&["java", "maven", "gradle", "jvm", "junit"]),
            patterns: regexes(&[
                r"(?i)\bjava\b",
                r"\bpublic (?:static )?\w+ \w+\(",
                r"System\.out\.print",
                r"\bprivate \w+ \w+;",
                r"@Override",
            ]),
            markers: strs(&["java", ".java", ".jar"]),
            frameworks: vec![FrameworkPattern::new(
                "spring",
                &["spring", "@autowired", "@restcontroller", "@service", "spring boot"],
            )],
        },
    ]
}

fn default_errors() -> Vec<ErrorSignature> {
    vec![
        ErrorSignature::new("TypeError", r"TypeError[^\n]*", 0.8),
        ErrorSignature::new("SyntaxError", r"SyntaxError[^\n]*", 0.9),
        ErrorSignature::new("ReferenceError", r"ReferenceError[^\n]*", 0.8),
        ErrorSignature::new("IndexError", r"IndexError[^\n]*", 0.7),
        ErrorSignature::new("KeyError", r"KeyError[^\n]*", 0.7),
        ErrorSignature::new("AttributeError", r"AttributeError[^\n]*", 0.7),
        ErrorSignature::new(
            "NullPointerException",
            r"NullPointerException[^\n]*",
            0.8,
        ),
        ErrorSignature::new("Panic", r"(?:panicked at|panic:)[^\n]*", 0.9),
        ErrorSignature::new(
            "Traceback",
            r"Traceback \(most recent call last\)",
            0.7,
        ),
        ErrorSignature::new(
            "CompileError",
            r"error\[E\d+\][^\n]*",
            0.8,
        ),
        ErrorSignature::new("GenericException", r"\b\w*Exception\b:[^\n]*", 0.6),
    ]
}

fn default_topics() -> Vec<TopicPattern> {
    vec![
        TopicPattern::new(
            "web development",
            &[
                "api", "rest", "http", "server", "frontend", "backend", "endpoint", "website",
                "browser",
            ],
        ),
        TopicPattern::new(
            "data science",
            &["data", "pandas", "numpy", "dataset", "analysis", "visualization", "notebook"],
        ),
        TopicPattern::new(
            "machine learning",
            &["model", "training", "neural", "inference", "prediction", "embedding", "fine-tune"],
        ),
        TopicPattern::new(
            "databases",
            &["database", "sql", "query", "table", "postgres", "mysql", "sqlite", "schema",
              "migration"],
        ),
        TopicPattern::new(
            "devops",
            &["docker", "kubernetes", "deploy", "deployment", "pipeline", "container",
              "terraform"],
        ),
        TopicPattern::new(
            "testing",
            &["test", "tests", "unit test", "integration", "mock", "assert", "coverage"],
        ),
        TopicPattern::new(
            "security",
            &["auth", "authentication", "token", "encryption", "vulnerability", "password",
              "permission"],
        ),
        TopicPattern::new(
            "performance",
            &["performance", "optimize", "optimization", "latency", "profiling", "cache",
              "benchmark"],
        ),
    ]
}
