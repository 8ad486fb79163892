use indicatif::ProgressStyle;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";
const STEP_TEMPLATE: &str = "{spinner:.green} {span_name} {msg}";

/// Style for spans tracking a known number of units.
pub(crate) fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Style for a single transform, with no progress.
pub(crate) fn step_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(STEP_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
