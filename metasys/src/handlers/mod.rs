//! Post-processing handlers that augment parsed components: translation
//! statistics, font rendering and screenshot media. Each handler is switched
//! by a feature flag in the configuration.

pub mod fonts;
pub mod locale;
pub mod screenshots;
