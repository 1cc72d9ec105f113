//! Emoji used by the terminal output, with plain-text fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Lifecycle phases
pub static CLONING: Emoji<'_, '_> = Emoji("📥 ", "[FETCH]");
pub static INSTALLING: Emoji<'_, '_> = Emoji("📦 ", "[INSTALL]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static STOPPED: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");

// Preview
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "[URL]");
