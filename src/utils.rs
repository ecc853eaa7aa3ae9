use std::sync::{
    atomic::{AtomicUsize, Ordering},
    LazyLock,
};

// -------------------------------------------------------------------------------------------------

const MINUS_INF_IN_DB: f32 = -200.0f32;

// -------------------------------------------------------------------------------------------------

/// Generates a unique usize number, by simply counting atomically upwards from 1.
pub fn unique_usize_id() -> usize {
    static ID_COUNTER: AtomicUsize = AtomicUsize::new(1);
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// -------------------------------------------------------------------------------------------------

pub fn linear_to_db(value: f32) -> f32 {
    static LIN_TO_DB_FACTOR: LazyLock<f32> = LazyLock::new(|| 20.0f32 / 10.0f32.ln());
    if value == 1.0 {
        return 0.0; // avoid rounding errors at exactly 0 dB
    } else if value > 1e-12f32 {
        return value.ln() * *LIN_TO_DB_FACTOR;
    }
    MINUS_INF_IN_DB
}

// -------------------------------------------------------------------------------------------------

pub fn db_to_linear(value: f32) -> f32 {
    static DB_TO_LIN_FACTOR: LazyLock<f32> = LazyLock::new(|| 10.0f32.ln() / 20.0f32);
    if value == 0.0f32 {
        return 1.0f32; // avoid rounding errors at exactly 0 dB
    } else if value > MINUS_INF_IN_DB {
        return (value * *DB_TO_LIN_FACTOR).exp();
    }
    0.0f32
}

// -------------------------------------------------------------------------------------------------

/// Frequency in Hz of the given (fractional) MIDI note number.
pub fn note_to_hz(note: f32) -> f32 {
    440.0 * 2.0f32.powf((note - 69.0) / 12.0)
}

// -------------------------------------------------------------------------------------------------

/// Given a previous frame, a current frame, the two next frames, and a fraction from 0.0 to 1.0
/// between the current frame and next frame, get an approximated frame.
///
/// This is the 4-point, 3rd-order Hermite interpolation x-form algorithm from "Polynomial
/// Interpolators for High-Quality Resampling of Oversampled Audio" by Olli Niemitalo, p. 43:
/// http://yehar.com/blog/wp-content/uploads/2009/08/deip.pdf
#[inline]
pub fn hermite_interpolate(ym1: f32, y0: f32, y1: f32, y2: f32, fraction: f32) -> f32 {
    debug_assert!((0.0..=1.0).contains(&fraction));
    let c0 = y0;
    let c1 = (y1 - ym1) * 0.5;
    let c2 = ym1 - y0 * 2.5 + y1 * 2.0 - y2 * 0.5;
    let c3 = (y2 - ym1) * 0.5 + (y0 - y1) * 1.5;
    ((c3 * fraction + c2) * fraction + c1) * fraction + c0
}

// -------------------------------------------------------------------------------------------------
