/// LCModel `.RAW` time-domain signal file
///
/// `$SEQPAR` and `$NMID` namelists followed by one `(2E16.6)` line per
/// complex sample. Dwell time and point count travel in the control file.

use std::fs;
use std::path::Path;

use crate::data::spectrum::Spectrum;

use super::control::ControlValue;

#[derive(Debug, Clone, PartialEq)]
pub struct RawHeader {
    pub id: String,
    pub echo_time_ms: f64,
    pub f0_mhz: f64,
    pub sequence: String,
    pub volume: f64,
    pub tramp: f64,
}

impl RawHeader {
    pub fn for_spectrum(id: &str, spectrum: &Spectrum, sequence: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            echo_time_ms: spectrum.te(),
            f0_mhz: spectrum.f0(),
            sequence: sequence.unwrap_or("PRESS").to_string(),
            volume: 1.0,
            tramp: 1.0,
        }
    }
}

/// Fortran `E16.6`: `0.123456E+03`, right-aligned in 16 columns
pub fn fortran_e(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{:>16}", "0.000000E+00");
    }
    let sign = if value < 0.0 { "-" } else { "" };
    let abs = value.abs();
    let mut exp = abs.log10().floor() as i32 + 1;
    let mut mantissa = abs / 10f64.powi(exp);
    if mantissa >= 1.0 {
        mantissa /= 10.0;
        exp += 1;
    }
    if mantissa < 0.1 {
        mantissa *= 10.0;
        exp -= 1;
    }
    let mut digits = (mantissa * 1e6).round() as u64;
    if digits >= 1_000_000 {
        digits = 100_000;
        exp += 1;
    }
    let exp_sign = if exp < 0 { '-' } else { '+' };
    format!(
        "{:>16}",
        format!("{}0.{:06}E{}{:02}", sign, digits, exp_sign, exp.abs())
    )
}

/// Render the RAW file. LCModel's sign convention is the complex conjugate
/// of some scanners' output, hence `conjugate`.
pub fn render_raw(spectrum: &Spectrum, header: &RawHeader, conjugate: bool) -> String {
    let mut out = String::new();
    out.push_str(" $SEQPAR\n");
    out.push_str(&format!(" echot= {}\n", ControlValue::Float(header.echo_time_ms)));
    out.push_str(&format!(" seq= {}\n", ControlValue::Text(header.sequence.clone())));
    out.push_str(&format!(" hzpppm= {}\n", ControlValue::Float(header.f0_mhz)));
    out.push_str(" $END\n");
    out.push_str(" $NMID\n");
    out.push_str(&format!(
        " id={}, fmtdat='(2E16.6)'\n",
        ControlValue::Text(header.id.clone())
    ));
    out.push_str(&format!(" volume= {}\n", ControlValue::Float(header.volume)));
    out.push_str(&format!(" tramp= {}\n", ControlValue::Float(header.tramp)));
    out.push_str(" $END\n");

    // single-channel spectra only; coil 0 is the whole signal
    for v in spectrum.coil(0) {
        let im = if conjugate { -v.im } else { v.im };
        out.push_str(&fortran_e(v.re));
        out.push_str(&fortran_e(im));
        out.push('\n');
    }
    out
}

pub fn write_raw(
    path: &Path,
    spectrum: &Spectrum,
    header: &RawHeader,
    conjugate: bool,
) -> std::io::Result<()> {
    fs::write(path, render_raw(spectrum, header, conjugate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::spectrum::tests::synthetic_fid;

    #[test]
    fn test_fortran_e() {
        assert_eq!(fortran_e(123.456), "    0.123456E+03");
        assert_eq!(fortran_e(1.0), "    0.100000E+01");
        assert_eq!(fortran_e(-0.5), "   -0.500000E+00");
        assert_eq!(fortran_e(0.0), "    0.000000E+00");
        assert_eq!(fortran_e(0.9999999), "    0.100000E+01");
        assert_eq!(fortran_e(-2.5e-7), "   -0.250000E-06");
    }

    #[test]
    fn test_raw_layout() {
        let s = synthetic_fid(8, 0.0005, 0.0, 0.1);
        let header = RawHeader::for_spectrum("voxel", &s, None);
        let text = render_raw(&s, &header, true);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], " $SEQPAR");
        assert_eq!(lines[1], " echot= 30");
        assert_eq!(lines[3], " hzpppm= 123.2");
        assert_eq!(lines[6], " id='voxel', fmtdat='(2E16.6)'");
        assert_eq!(lines.len(), 10 + 8);
        // first sample of a zero-offset FID is 1 + 0i
        assert_eq!(lines[10], "    0.100000E+01    0.000000E+00");
        assert!(lines[10..].iter().all(|l| l.len() == 32));
    }
}
