//! diagnostics.rs — Collecte et rendu des erreurs/avertissements.
//!
//! - Chaque rapport : `fichier:ligne:col: niveau: message`, bloc de contexte
//!   source avec caret souligné (largeur = longueur du span), suggestion
//!   optionnelle.
//! - Cap `max_errors` : au-delà, les ERROR sont abandonnées et l'avis de
//!   seuil est émis exactement une fois. Les avertissements ne sont pas
//!   plafonnés.
//! - Verrou FATAL : après un rapport fatal, tout rapport ultérieur est
//!   silencieusement ignoré.
//! - Mono-thread, aucune ré-entrance requise.

use std::fmt::Write as _;

/* ───────────────────────── Niveaux & phases ───────────────────────── */

/// Gravité d'un diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Warning,
    Error,
    Fatal,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Warning => "avertissement",
            Level::Error => "erreur",
            Level::Fatal => "fatal",
        }
    }

    fn ansi(self) -> &'static str {
        match self {
            Level::Warning => "\x1b[33m",
            Level::Error => "\x1b[31m",
            Level::Fatal => "\x1b[31;1m",
        }
    }
}

/// Phase du pipeline ayant produit le diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lex,
    Parse,
    Sema,
    Compile,
    Runtime,
}

/* ───────────────────────── Span source ───────────────────────── */

/// Localisation 1-based + longueur du span fautif (pour le caret).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub col: u32,
    pub len: u32,
}

impl Span {
    pub fn new(line: u32, col: u32, len: u32) -> Self {
        Self { line, col, len }
    }
}

/* ───────────────────────── Entrées ───────────────────────── */

/// Un diagnostic enregistré, avec sa forme rendue.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: Level,
    pub phase: Phase,
    pub span: Option<Span>,
    pub message: String,
    pub suggestion: Option<String>,
    pub rendered: String,
}

/* ───────────────────────── Collecteur ───────────────────────── */

const DEFAULT_MAX_ERRORS: usize = 20;

/// Collecteur de diagnostics du pipeline entier.
pub struct Diagnostics {
    file: String,
    source: String,
    entries: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
    max_errors: usize,
    fatal: bool,
    color: bool,
    cap_notified: bool,
    /// Imprime sur stderr au fil de l'eau (coupé pour les tests).
    echo: bool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            file: String::from("<script>"),
            source: String::new(),
            entries: Vec::new(),
            errors: 0,
            warnings: 0,
            max_errors: DEFAULT_MAX_ERRORS,
            fatal: false,
            color: false,
            cap_notified: false,
            echo: true,
        }
    }

    /// Variante muette : n'écrit rien sur stderr (tests, REPL interne).
    pub fn silent() -> Self {
        Self { echo: false, ..Self::new() }
    }

    /// Fixe le fichier + texte source, pour le bloc de contexte caret.
    pub fn set_source(&mut self, file: impl Into<String>, text: impl Into<String>) {
        self.file = file.into();
        self.source = text.into();
    }

    pub fn enable_color(&mut self, on: bool) {
        self.color = on;
    }

    pub fn set_max_errors(&mut self, cap: usize) {
        self.max_errors = cap.max(1);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.errors = 0;
        self.warnings = 0;
        self.fatal = false;
        self.cap_notified = false;
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0 || self.fatal
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal
    }

    /// Nombre d'erreurs (hors avertissements).
    pub fn count(&self) -> usize {
        self.errors
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Tout le flux rendu, concaténé (pratique pour asserter en test).
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&e.rendered);
        }
        out
    }

    /// Enregistre un diagnostic. Voir les règles de cap/fatal en tête de module.
    pub fn report(
        &mut self,
        level: Level,
        phase: Phase,
        span: Option<Span>,
        message: impl Into<String>,
        suggestion: Option<&str>,
    ) {
        if self.fatal {
            return;
        }
        match level {
            Level::Warning => self.warnings += 1,
            Level::Error => {
                if self.errors >= self.max_errors {
                    if !self.cap_notified {
                        self.cap_notified = true;
                        let notice = format!(
                            "{}: trop d'erreurs ({}), les suivantes sont abandonnées\n",
                            self.file, self.max_errors
                        );
                        if self.echo {
                            eprint!("{notice}");
                        }
                        self.entries.push(Diagnostic {
                            level: Level::Warning,
                            phase,
                            span: None,
                            message: notice.clone(),
                            suggestion: None,
                            rendered: notice,
                        });
                    }
                    return;
                }
                self.errors += 1;
            }
            Level::Fatal => {
                self.fatal = true;
            }
        }

        let message = message.into();
        let rendered = self.render(level, span, &message, suggestion);
        if self.echo {
            eprint!("{rendered}");
        }
        self.entries.push(Diagnostic {
            level,
            phase,
            span,
            message,
            suggestion: suggestion.map(str::to_string),
            rendered,
        });
    }

    /* ────── rendu ────── */

    fn render(&self, level: Level, span: Option<Span>, message: &str, suggestion: Option<&str>) -> String {
        let mut out = String::new();
        let (c_on, c_off) = if self.color { (level.ansi(), "\x1b[0m") } else { ("", "") };
        match span {
            Some(s) => {
                let _ = writeln!(
                    &mut out,
                    "{}:{}:{}: {c_on}{}{c_off}: {}",
                    self.file,
                    s.line,
                    s.col,
                    level.label(),
                    message
                );
                if let Some(text) = self.source_line(s.line) {
                    let _ = writeln!(&mut out, "  {text}");
                    let pad = " ".repeat(2 + s.col.saturating_sub(1) as usize);
                    let carets = "^".repeat(s.len.max(1) as usize);
                    let _ = writeln!(&mut out, "{pad}{c_on}{carets}{c_off}");
                }
            }
            None => {
                let _ = writeln!(&mut out, "{}: {c_on}{}{c_off}: {}", self.file, level.label(), message);
            }
        }
        if let Some(sug) = suggestion {
            let _ = writeln!(&mut out, "  suggestion: {sug}");
        }
        out
    }

    fn source_line(&self, line: u32) -> Option<&str> {
        if self.source.is_empty() || line == 0 {
            return None;
        }
        self.source.lines().nth(line as usize - 1)
    }
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    fn diags() -> Diagnostics {
        let mut d = Diagnostics::silent();
        d.set_source("test.swift", "let x = 10\nlet y = oops\n");
        d
    }

    #[test]
    fn counts_and_levels() {
        let mut d = diags();
        d.report(Level::Error, Phase::Sema, Some(Span::new(2, 9, 4)), "nom non déclaré: oops", None);
        d.report(Level::Warning, Phase::Sema, None, "variable jamais lue: x", None);
        assert_eq!(d.count(), 1);
        assert_eq!(d.warning_count(), 1);
        assert!(d.has_errors());
        assert!(!d.has_fatal());
    }

    #[test]
    fn caret_width_matches_span() {
        let mut d = diags();
        d.report(Level::Error, Phase::Sema, Some(Span::new(2, 9, 4)), "nom non déclaré", None);
        let out = d.rendered();
        assert!(out.contains("test.swift:2:9: erreur: nom non déclaré"));
        assert!(out.contains("^^^^"));
        assert!(!out.contains("^^^^^"));
    }

    #[test]
    fn fatal_latch_drops_followups() {
        let mut d = diags();
        d.report(Level::Fatal, Phase::Compile, None, "invariant interne violé", None);
        d.report(Level::Error, Phase::Compile, None, "jamais enregistré", None);
        assert!(d.has_fatal());
        assert_eq!(d.count(), 0);
        assert_eq!(d.entries().len(), 1);
    }

    #[test]
    fn error_cap_notice_once() {
        let mut d = diags();
        d.set_max_errors(3);
        for i in 0..10 {
            d.report(Level::Error, Phase::Parse, None, format!("erreur {i}"), None);
        }
        assert_eq!(d.count(), 3);
        let notices = d.rendered().matches("trop d'erreurs").count();
        assert_eq!(notices, 1);
        // les warnings passent toujours
        d.report(Level::Warning, Phase::Parse, None, "toujours émis", None);
        assert_eq!(d.warning_count(), 1);
    }

    #[test]
    fn suggestion_line() {
        let mut d = diags();
        d.report(
            Level::Error,
            Phase::Parse,
            Some(Span::new(1, 5, 1)),
            "token inattendu",
            Some("ajouter `;`"),
        );
        assert!(d.rendered().contains("suggestion: ajouter `;`"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut d = diags();
        d.report(Level::Error, Phase::Parse, None, "x", None);
        d.clear();
        assert_eq!(d.count(), 0);
        assert!(!d.has_errors());
        assert!(d.rendered().is_empty());
    }
}
