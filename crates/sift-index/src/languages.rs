//! Language detection and per-language declaration recognizers.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Source language of a file. `Unknown` files are chunked with the generic recognizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Swift,
    Shell,
    Unknown,
}

impl Lang {
    /// Identifier stored with chunks and used in vector payloads.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Kotlin => "kotlin",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Shell => "shell",
            Self::Unknown => "unknown",
        }
    }

    /// Normalize a free-form language name (`golang`, `js`, `C++`, ...).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rust" | "rs" => Self::Rust,
            "python" | "py" | "python3" => Self::Python,
            "javascript" | "js" | "jsx" | "node" | "nodejs" => Self::JavaScript,
            "typescript" | "ts" | "tsx" => Self::TypeScript,
            "go" | "golang" => Self::Go,
            "java" => Self::Java,
            "kotlin" | "kt" | "kts" => Self::Kotlin,
            "c" | "h" => Self::C,
            "cpp" | "c++" | "cxx" | "cc" | "hpp" => Self::Cpp,
            "csharp" | "c#" | "cs" => Self::CSharp,
            "ruby" | "rb" => Self::Ruby,
            "php" => Self::Php,
            "swift" => Self::Swift,
            "shell" | "sh" | "bash" | "zsh" => Self::Shell,
            _ => Self::Unknown,
        }
    }

    /// Ordered recognizers for this language, falling back to the generic set.
    #[must_use]
    pub fn recognizers(self) -> &'static [Recognizer] {
        match self {
            Self::Rust => RUST.as_slice(),
            Self::Python => PYTHON.as_slice(),
            Self::JavaScript => JAVASCRIPT.as_slice(),
            Self::TypeScript => TYPESCRIPT.as_slice(),
            Self::Go => GO.as_slice(),
            Self::Java => JAVA.as_slice(),
            Self::Kotlin => KOTLIN.as_slice(),
            Self::C => C.as_slice(),
            Self::Cpp => CPP.as_slice(),
            Self::CSharp => CSHARP.as_slice(),
            Self::Ruby => RUBY.as_slice(),
            Self::Php => PHP.as_slice(),
            Self::Swift => SWIFT.as_slice(),
            Self::Shell => SHELL.as_slice(),
            Self::Unknown => GENERIC.as_slice(),
        }
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Lang {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Lang::Unknown;
    };
    match ext.to_ascii_lowercase().as_str() {
        "rs" => Lang::Rust,
        "py" | "pyi" => Lang::Python,
        "js" | "jsx" | "mjs" | "cjs" => Lang::JavaScript,
        "ts" | "tsx" | "mts" | "cts" => Lang::TypeScript,
        "go" => Lang::Go,
        "java" => Lang::Java,
        "kt" | "kts" => Lang::Kotlin,
        "c" | "h" => Lang::C,
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => Lang::Cpp,
        "cs" => Lang::CSharp,
        "rb" => Lang::Ruby,
        "php" => Lang::Php,
        "swift" => Lang::Swift,
        "sh" | "bash" | "zsh" => Lang::Shell,
        _ => Lang::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecognizerKind {
    Function,
    Class,
    Type,
    Variable,
    Import,
}

/// A declaration pattern. The first participating capture group is the extracted name.
#[derive(Debug)]
pub struct Recognizer {
    pub kind: RecognizerKind,
    regex: Regex,
}

impl Recognizer {
    fn new(kind: RecognizerKind, pattern: &str) -> Self {
        Self {
            kind,
            regex: Regex::new(pattern).expect("recognizer pattern must compile"),
        }
    }

    /// All names this recognizer extracts from `text`, in source order.
    pub fn names<'t>(&'t self, text: &'t str) -> impl Iterator<Item = &'t str> + 't {
        self.regex.captures_iter(text).filter_map(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().trim())
                .find(|s| !s.is_empty())
        })
    }
}

/// Control-flow keywords that loose function patterns in C-like languages pick up.
pub(crate) const NOT_A_NAME: &[&str] = &[
    "if", "else", "for", "foreach", "while", "switch", "catch", "return", "new", "sizeof", "do",
    "try", "using", "lock", "when",
];

fn set(items: &[(RecognizerKind, &str)]) -> Vec<Recognizer> {
    items
        .iter()
        .map(|(kind, pattern)| Recognizer::new(*kind, pattern))
        .collect()
}

use RecognizerKind::{Class, Function, Import, Type, Variable};

static RUST: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r#"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+([A-Za-z_]\w*)"#,
        ),
        (
            Class,
            r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|union)\s+([A-Za-z_]\w*)",
        ),
        (
            Type,
            r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?type\s+([A-Za-z_]\w*)",
        ),
        (
            Variable,
            r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:let(?:\s+mut)?|const|static(?:\s+mut)?)\s+([A-Za-z_]\w*)",
        ),
        (Import, r"(?m)^\s*(?:pub\s+)?use\s+([^;]+);"),
    ])
});

static PYTHON: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (Function, r"(?m)^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)"),
        (Class, r"(?m)^\s*class\s+([A-Za-z_]\w*)"),
        (Variable, r"(?m)^([A-Za-z_]\w*)\s*(?::[^=\n]+)?=[^=]"),
        (
            Import,
            r"(?m)^\s*(?:from\s+([\w.]+)\s+import\b|import\s+([\w.]+))",
        ),
    ])
});

const JS_FUNCTION: &str = r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)";
const JS_ARROW: &str = r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>";
const JS_CLASS: &str =
    r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)";
const JS_VARIABLE: &str = r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)";
const JS_IMPORT: &str = r#"(?m)^\s*import\s+(?:[^'"]*?\s+from\s+)?['"]([^'"]+)['"]"#;
const JS_REQUIRE: &str = r#"require\(\s*['"]([^'"]+)['"]\s*\)"#;

static JAVASCRIPT: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (Function, JS_FUNCTION),
        (Function, JS_ARROW),
        (Class, JS_CLASS),
        (Variable, JS_VARIABLE),
        (Import, JS_IMPORT),
        (Import, JS_REQUIRE),
    ])
});

static TYPESCRIPT: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (Function, JS_FUNCTION),
        (Function, JS_ARROW),
        (Class, JS_CLASS),
        (
            Type,
            r"(?m)^\s*(?:export\s+)?(?:declare\s+)?(?:type|interface|enum)\s+([A-Za-z_$][\w$]*)",
        ),
        (Variable, JS_VARIABLE),
        (Import, JS_IMPORT),
        (Import, JS_REQUIRE),
    ])
});

static GO: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (Function, r"(?m)^func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)"),
        (
            Class,
            r"(?m)^\s*type\s+([A-Za-z_]\w*)\s+(?:struct|interface)\b",
        ),
        (
            Type,
            r"(?m)^\s*type\s+([A-Za-z_]\w*)\s+(?:=|func\b|map\[|chan\b|\[|\*|[A-Za-z_][\w.]*\s*$)",
        ),
        (Variable, r"(?m)^\s*(?:var|const)\s+([A-Za-z_]\w*)"),
        (Variable, r"(?m)^\s*([A-Za-z_]\w*)\s*:="),
        (Import, r#"(?m)^\s*import\s+(?:[A-Za-z_.]\w*\s+)?"([^"]+)""#),
        (Import, r#"(?m)^\s+(?:[A-Za-z_.]\w*\s+)?"([^"]+)"\s*$"#),
    ])
});

static JAVA: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|native|default)\s+)*(?:<[^>]+>\s+)?[\w<>\[\],.?]+\s+([a-zA-Z_]\w*)\s*\([^;{]*\)\s*(?:throws\s+[\w.,\s]+)?\{",
        ),
        (
            Class,
            r"(?m)^\s*(?:(?:public|private|protected|static|final|abstract|sealed)\s+)*(?:class|interface|enum|record)\s+([A-Za-z_]\w*)",
        ),
        (
            Variable,
            r"(?m)^\s*(?:(?:public|private|protected|static|final)\s+)+[\w<>\[\],.?]+\s+([a-zA-Z_]\w*)\s*(?:=|;)",
        ),
        (Import, r"(?m)^\s*import\s+(?:static\s+)?([\w.*]+)\s*;"),
    ])
});

static KOTLIN: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:(?:public|private|protected|internal|override|open|suspend|inline|operator|infix|abstract)\s+)*fun\s+(?:<[^>]+>\s*)?(?:[\w.]+\.)?([A-Za-z_]\w*)",
        ),
        (
            Class,
            r"(?m)^\s*(?:(?:public|private|protected|internal|open|abstract|sealed|data|enum|inner|annotation)\s+)*(?:class|interface|object)\s+([A-Za-z_]\w*)",
        ),
        (Type, r"(?m)^\s*typealias\s+([A-Za-z_]\w*)"),
        (
            Variable,
            r"(?m)^\s*(?:(?:private|public|protected|internal|const|lateinit|override)\s+)*(?:val|var)\s+([A-Za-z_]\w*)",
        ),
        (Import, r"(?m)^\s*import\s+([\w.*]+)"),
    ])
});

const C_INCLUDE: &str = r#"(?m)^\s*#\s*include\s*[<"]([^>"]+)[>"]"#;
const C_VARIABLE: &str = r"(?m)^(?:(?:static|extern|const)\s+)*(?:(?:unsigned|signed)\s+)?(?:int|char|long|short|float|double|bool|size_t|[A-Za-z_]\w*_t)\s*\**\s*([A-Za-z_]\w*)\s*(?:=|;|\[)";

static C: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^[A-Za-z_][\w \t\*]*?\b([A-Za-z_]\w*)\s*\([^;{]*\)\s*\{",
        ),
        (
            Class,
            r"(?m)^\s*(?:typedef\s+)?(?:struct|union|enum)\s+([A-Za-z_]\w*)",
        ),
        (Type, r"(?m)^\s*typedef\s+[^;{]*?\b([A-Za-z_]\w*)\s*;"),
        (Variable, C_VARIABLE),
        (Import, C_INCLUDE),
    ])
});

static CPP: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^[A-Za-z_][\w \t\*&:<>,]*?\b([A-Za-z_~]\w*)\s*\([^;{]*\)\s*(?:const\s*)?(?:noexcept\s*)?(?:override\s*)?\{",
        ),
        (
            Class,
            r"(?m)^\s*(?:template\s*<[^>]*>\s*)?(?:class|struct|union|enum(?:\s+class)?)\s+([A-Za-z_]\w*)",
        ),
        (Type, r"(?m)^\s*typedef\s+[^;{]*?\b([A-Za-z_]\w*)\s*;"),
        (Type, r"(?m)^\s*using\s+([A-Za-z_]\w*)\s*="),
        (Variable, C_VARIABLE),
        (Variable, r"(?m)^\s*auto\s+&?([A-Za-z_]\w*)\s*="),
        (Import, C_INCLUDE),
    ])
});

static CSHARP: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:(?:public|private|protected|internal|static|virtual|override|async|abstract|sealed|extern|partial|new)\s+)+[\w<>\[\],.?]+\s+([A-Za-z_]\w*)\s*\([^;{]*\)\s*\{?\s*$",
        ),
        (
            Class,
            r"(?m)^\s*(?:(?:public|private|protected|internal|static|abstract|sealed|partial)\s+)*(?:class|interface|struct|record|enum)\s+([A-Za-z_]\w*)",
        ),
        (Variable, r"(?m)^\s*var\s+([A-Za-z_]\w*)\s*="),
        (Import, r"(?m)^\s*using\s+(?:static\s+)?([\w.]+)\s*;"),
    ])
});

static RUBY: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (Function, r"(?m)^\s*def\s+(?:self\.)?([A-Za-z_]\w*[?!=]?)"),
        (Class, r"(?m)^\s*(?:class|module)\s+([A-Z]\w*(?:::\w+)*)"),
        (Variable, r"(?m)^\s*([A-Z][A-Z0-9_]*)\s*=[^=]"),
        (
            Import,
            r#"(?m)^\s*require(?:_relative)?\s*\(?\s*['"]([^'"]+)['"]"#,
        ),
    ])
});

static PHP: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:(?:public|private|protected|static|abstract|final)\s+)*function\s+&?([A-Za-z_]\w*)",
        ),
        (
            Class,
            r"(?m)^\s*(?:(?:abstract|final|readonly)\s+)*(?:class|interface|trait|enum)\s+([A-Za-z_]\w*)",
        ),
        (Variable, r"(?m)^\s*\$([A-Za-z_]\w*)\s*=[^=]"),
        (
            Import,
            r#"(?m)^\s*(?:use\s+([\w\\]+)|(?:require|include)(?:_once)?\s*\(?\s*['"]([^'"]+)['"])"#,
        ),
    ])
});

static SWIFT: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:(?:public|private|internal|fileprivate|open|static|class|override|mutating|@\w+)\s+)*func\s+([A-Za-z_]\w*)",
        ),
        (
            Class,
            r"(?m)^\s*(?:(?:public|private|internal|fileprivate|open|final)\s+)*(?:class|struct|enum|protocol|actor|extension)\s+([A-Za-z_]\w*)",
        ),
        (
            Type,
            r"(?m)^\s*(?:(?:public|private|internal|fileprivate)\s+)*typealias\s+([A-Za-z_]\w*)",
        ),
        (
            Variable,
            r"(?m)^\s*(?:(?:public|private|internal|fileprivate|static|lazy|weak)\s+)*(?:let|var)\s+([A-Za-z_]\w*)",
        ),
        (Import, r"(?m)^\s*import\s+([\w.]+)"),
    ])
});

static SHELL: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:function\s+([A-Za-z_][\w-]*)|([A-Za-z_][\w-]*)\s*\(\)\s*\{?)",
        ),
        (
            Variable,
            r"(?m)^\s*(?:export\s+|local\s+|readonly\s+|declare\s+(?:-\w+\s+)?)?([A-Za-z_]\w*)=",
        ),
        (Import, r#"(?m)^\s*(?:source|\.)\s+['"]?([^\s'";]+)"#),
    ])
});

static GENERIC: LazyLock<Vec<Recognizer>> = LazyLock::new(|| {
    set(&[
        (
            Function,
            r"(?m)^\s*(?:(?:export|public|private|protected|static|async|pub)\s+)*(?:function|func|fn|def|fun|sub|proc)\s+([A-Za-z_]\w*)",
        ),
        (
            Class,
            r"(?m)^\s*(?:(?:export|public|private|abstract)\s+)*(?:class|struct|interface|trait|module)\s+([A-Za-z_]\w*)",
        ),
        (Variable, r"(?m)^\s*(?:const|let|var|val)\s+([A-Za-z_]\w*)"),
        (
            Import,
            r#"(?m)^\s*(?:import|require|include|use|using)\s+['"<]?([\w./:@-]+)"#,
        ),
    ])
});

/// Decision-point patterns for the complexity estimate. Each match adds one.
pub(crate) static DECISION_POINTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bif\b",
        r"\belse\b",
        r"\b(?:elif|elsif|elseif)\b",
        r"\b(?:for|foreach|while|loop|until)\b",
        r"\b(?:switch|match|when)\b",
        r"\bcase\b",
        r"\b(?:catch|except|rescue)\b",
        r"\s\?\s",
        r"&&|\|\|",
        r"\b(?:and|or)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("decision point pattern must compile"))
    .collect()
});
