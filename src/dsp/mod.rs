//! Signal-processing primitives shared by the preprocessing pipeline, the
//! feature extractors and the quality assessor.

pub mod fft;
pub mod filter;
pub mod hilbert;
pub mod ica;
pub mod stats;
pub mod wavelet;

pub use fft::{band_power, periodogram, simpson, welch_csd, welch_psd};
pub use filter::{
    butter_bandpass, butter_highpass, butter_lowpass, cached_notch, notch_filtfilt,
    savgol_smooth, Biquad, Sos,
};
pub use hilbert::{analytic, envelope, instantaneous_frequency, instantaneous_phase};
pub use ica::{fast_ica, IcaModel};
