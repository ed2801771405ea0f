use std::io::Write;

use crate::Tick;

/// How measured ticks are laid out on the output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputStyle {
    /// One line per tick.
    #[default]
    Lines,
    /// Carriage return before every tick, so a terminal shows one updating line.
    Overwrite,
}

/// Six decimals, space in place of a `+` sign, minimum width 6.
pub fn format_value(value: f32) -> String {
    if value.is_sign_negative() {
        format!("{:>6.6}", value)
    } else {
        format!(" {:>5.6}", value)
    }
}

/// Channel A (V, I) then channel B (V, I), single-space separated.
pub fn format_tick(tick: &Tick) -> String {
    [tick.a.0, tick.a.1, tick.b.0, tick.b.1]
        .iter()
        .map(|&v| format_value(v))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn write_ticks<W: Write + ?Sized>(out: &mut W, ticks: &[Tick], style: OutputStyle) -> std::io::Result<()> {
    for tick in ticks {
        match style {
            OutputStyle::Lines => writeln!(out, "{}", format_tick(tick))?,
            OutputStyle::Overwrite => write!(out, "\r{}", format_tick(tick))?,
        }
    }
    out.flush()
}
