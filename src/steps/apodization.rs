/// Line broadening and zero-padding
///
/// Both are stateless, per-repetition and keep scan metadata via `inherit`.

use crate::data::spectrum::Spectrum;
use crate::dsp::window::WindowFunction;

use super::parameter::ParameterSet;
use super::{DataBag, Step, StepError, StepKind, StepOutcome};

/// Apply an apodization window to one spectrum (all coils)
pub fn apodize(spectrum: &Spectrum, window: WindowFunction) -> Result<Spectrum, StepError> {
    if window == WindowFunction::None {
        return Ok(spectrum.clone());
    }
    let np = spectrum.np();
    let samples = spectrum
        .samples()
        .chunks(np)
        .flat_map(|coil| window.apply(coil, spectrum.dt()))
        .collect();
    Ok(spectrum.inherit(samples)?)
}

// ============================================================================
//  Line broadening
// ============================================================================

pub struct LineBroadening {
    params: ParameterSet,
}

impl Default for LineBroadening {
    fn default() -> Self {
        Self {
            params: ParameterSet::new()
                .choice("window", "Window", "lorentzian", &["lorentzian", "gaussian"])
                .float("factor", "Broadening (Hz)", 1.0, 0.0, 100.0),
        }
    }
}

impl LineBroadening {
    pub fn window(&self) -> Result<WindowFunction, StepError> {
        Ok(WindowFunction::from_label(
            self.params.get_text("window")?,
            self.params.get_float("factor")?,
        ))
    }
}

impl Step for LineBroadening {
    fn kind(&self) -> StepKind {
        StepKind::LineBroadening
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        let window = self.window()?;
        log::debug!("Line broadening: {}", window);
        data.output = Some(data.input.map_spectra(|s| apodize(s, window))?);
        Ok(StepOutcome::ok())
    }
}

// ============================================================================
//  Zero padding
// ============================================================================

/// Appends `factor × np` zeros to the data and the water reference, so that
/// later water-referenced steps still see matching lengths.
pub struct ZeroPadding {
    params: ParameterSet,
}

impl Default for ZeroPadding {
    fn default() -> Self {
        Self {
            params: ParameterSet::new().integer("factor", "Padding factor", 1, 0, 16),
        }
    }
}

impl Step for ZeroPadding {
    fn kind(&self) -> StepKind {
        StepKind::ZeroPadding
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn process(&mut self, data: &mut DataBag) -> Result<StepOutcome, StepError> {
        let factor = self.params.get_usize("factor")?;
        if factor == 0 {
            data.pass_through();
            return Ok(StepOutcome::ok());
        }
        let pad = |s: &Spectrum| Ok::<_, StepError>(s.zero_pad(factor));
        data.output = Some(data.input.map_spectra(pad)?);
        if let Some(wref) = &data.wref {
            data.wref_output = Some(wref.map_spectra(pad)?);
        }
        Ok(StepOutcome::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::import::Header;
    use crate::data::spectrum::tests::synthetic_fid;
    use crate::data::transients::Transients;
    use crate::steps::parameter::ParameterValue;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_zero_padding_pads_data_and_wref() {
        let fid = synthetic_fid(64, 0.001, 0.0, 0.1);
        let mut bag = DataBag::new(
            Transients::Svs(vec![fid.clone(); 2]),
            Some(Transients::Svs(vec![fid.clone()])),
            Header::default(),
        );
        let mut step = ZeroPadding::default();
        step.set_parameter("factor", ParameterValue::Integer(2)).unwrap();
        step.process(&mut bag).unwrap();

        let out = bag.output.unwrap();
        let first = out.first().unwrap();
        assert_eq!(first.np(), 192);
        assert_eq!(&first.samples()[..64], fid.samples());
        assert_eq!(first.f0(), fid.f0());
        assert_eq!(first.te(), fid.te());
        assert_eq!(bag.wref_output.unwrap().first().unwrap().np(), 192);
    }

    #[test]
    fn test_zero_padding_factor_zero_is_identity() {
        let fid = synthetic_fid(64, 0.001, 0.0, 0.1);
        let input = Transients::Svs(vec![fid]);
        let mut bag = DataBag::new(input.clone(), None, Header::default());
        let mut step = ZeroPadding::default();
        step.set_parameter("factor", ParameterValue::Integer(0)).unwrap();
        step.process(&mut bag).unwrap();
        assert_eq!(bag.output.unwrap(), input);
    }

    #[test]
    fn test_line_broadening_lorentzian() {
        let fid = synthetic_fid(64, 0.001, 0.0, 1e9);
        let mut bag = DataBag::new(Transients::Svs(vec![fid.clone()]), None, Header::default());
        let mut step = LineBroadening::default();
        step.set_parameter("factor", ParameterValue::Float(10.0)).unwrap();
        step.process(&mut bag).unwrap();

        let out = bag.output.unwrap();
        let s = out.first().unwrap();
        let t = 10.0 * 0.001;
        let expected = fid.samples()[10].norm() * (-t * std::f64::consts::PI * 10.0).exp();
        assert_abs_diff_eq!(s.samples()[10].norm(), expected, epsilon = 1e-12);
        assert_eq!(s.dt(), fid.dt());
    }

    #[test]
    fn test_line_broadening_rejects_negative_factor() {
        let mut step = LineBroadening::default();
        assert!(step.set_parameter("factor", ParameterValue::Float(-1.0)).is_err());
    }
}
