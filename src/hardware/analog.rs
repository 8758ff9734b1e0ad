//! Analog front-end conversions: ADC volts to engineering units.
//!
//! The pressure gauge (MPX5010DP, single-ended) and the orifice differential
//! sensor (MPX10DP) both arrive as voltages from an external ADC driver. This
//! module carries the calibration constants and conversion math, plus generic
//! [`PressureSensor`]/[`FlowSensor`] implementations over any [`AnalogInput`],
//! so the control pipeline never sees a raw voltage.
//!
//! Flow is derived from the differential pressure across an orifice plate,
//! incompressible form only: airway pressures stay far below the ratio where
//! choked flow matters. Air density defaults to a fixed 1.2 kg/m³ but can be
//! supplied from an ambient temperature/pressure/humidity measurement via
//! [`humid_air_density`].

use anyhow::Result;
use async_trait::async_trait;

use super::{FlowSensor, PressureSensor};

/// Capability: raw ADC voltage readout for one configured channel.
#[async_trait]
pub trait AnalogInput: Send + Sync {
    /// Read the channel voltage in volts. May block briefly on bus I/O.
    async fn read_volts(&self) -> Result<f64>;
}

/// Transfer function of a ratiometric pressure gauge.
#[derive(Clone, Copy, Debug)]
pub struct GaugeCalibration {
    /// Output voltage at zero pressure.
    pub min_volt: f64,
    /// Output voltage at full-scale pressure.
    pub max_volt: f64,
    /// Full-scale pressure in cmH₂O.
    pub max_pressure_cmh2o: f64,
}

impl Default for GaugeCalibration {
    /// MPX5010DP: 0.2–4.7 V over 0–10 kPa (101.978 cmH₂O).
    fn default() -> Self {
        Self {
            min_volt: 0.2,
            max_volt: 4.7,
            max_pressure_cmh2o: 101.978,
        }
    }
}

impl GaugeCalibration {
    /// Convert a gauge output voltage to cmH₂O.
    pub fn pressure_from_volts(&self, volts: f64) -> f64 {
        self.max_pressure_cmh2o * ((volts - self.min_volt) / (self.max_volt - self.min_volt))
    }
}

/// Transfer function of a differential pressure sensor.
#[derive(Clone, Copy, Debug)]
pub struct DpCalibration {
    /// Full-span output voltage.
    pub span_volts: f64,
    /// Differential pressure at full span, Pa.
    pub span_pa: f64,
    /// Electrical zero offset, volts.
    pub offset_volts: f64,
}

impl Default for DpCalibration {
    /// MPX10DP: 35 mV span over 10 kPa, measured zero offset 27.4 mV.
    fn default() -> Self {
        Self {
            span_volts: 0.035,
            span_pa: 10_000.0,
            offset_volts: 0.0274,
        }
    }
}

impl DpCalibration {
    /// Convert a sensor output voltage to a signed differential pressure in Pa.
    pub fn dp_from_volts(&self, volts: f64) -> f64 {
        (volts - self.offset_volts) * self.span_pa / self.span_volts
    }
}

/// Geometry of the orifice flow tube.
#[derive(Clone, Copy, Debug)]
pub struct OrificeGeometry {
    /// Inner diameter of the tube upstream of the plate, m.
    pub tube_diameter_m: f64,
    /// Diameter of the orifice, m.
    pub orifice_diameter_m: f64,
}

impl Default for OrificeGeometry {
    /// The printed flow tube: 18.5 mm bore, 4.0 mm orifice.
    fn default() -> Self {
        Self {
            tube_diameter_m: 0.0185,
            orifice_diameter_m: 0.0040,
        }
    }
}

impl OrificeGeometry {
    /// Volumetric flow through the orifice for a signed differential
    /// pressure, in L/min. Sign follows the sign of `dp_pa`.
    ///
    /// Incompressible orifice-plate form with the discharge coefficient
    /// taken as the area ratio, matching the deployed flow tube.
    pub fn flow_lpm_from_dp(&self, dp_pa: f64, rho_kg_m3: f64) -> f64 {
        let d1 = self.tube_diameter_m;
        let d2 = self.orifice_diameter_m;
        let a1 = std::f64::consts::PI * (d1 / 2.0) * (d1 / 2.0);
        let a2 = std::f64::consts::PI * (d2 / 2.0) * (d2 / 2.0);
        let cd = a2 / a1;
        let d_ratio = d2 / d1;

        let direction = if dp_pa < 0.0 { -1.0 } else { 1.0 };
        let q_m3_s = cd
            * (std::f64::consts::PI / 4.0)
            * d2.powi(2)
            * (2.0 * dp_pa.abs() / (rho_kg_m3 * (1.0 - d_ratio).powi(4))).sqrt();

        q_m3_s * 60_000.0 * direction
    }
}

/// Density of humid air from ambient conditions, kg/m³.
///
/// Uses Tetens' saturation vapor pressure and the partial-pressure mixture
/// of dry air and water vapor.
pub fn humid_air_density(temp_c: f64, pressure_mbar: f64, humidity_pct: f64) -> f64 {
    const R: f64 = 8.31446; // Universal gas constant, J/(K·mol)
    const M_D: f64 = 0.0289652; // Molar mass of dry air, kg/mol
    const M_V: f64 = 0.018016; // Molar mass of water vapor, kg/mol

    let temp_k = temp_c + 273.15;
    let pressure_pa = pressure_mbar * 100.0;

    // Tetens' equation (temperature in Celsius, result in Pa).
    let p_sat = 610.78 * 10f64.powf(7.5 * temp_c / (temp_c + 237.3));
    let p_vapor = (humidity_pct / 100.0) * p_sat;
    let p_dry = pressure_pa - p_vapor;

    (p_dry * M_D + p_vapor * M_V) / (R * temp_k)
}

/// Density used when no ambient sensor is fitted, kg/m³.
pub const DEFAULT_AIR_DENSITY: f64 = 1.2;

/// A [`PressureSensor`] built from any analog input and a gauge calibration.
pub struct AnalogPressureSensor<A: AnalogInput> {
    adc: A,
    calibration: GaugeCalibration,
}

impl<A: AnalogInput> AnalogPressureSensor<A> {
    /// Wrap an ADC channel with the default MPX5010DP calibration.
    pub fn new(adc: A) -> Self {
        Self::with_calibration(adc, GaugeCalibration::default())
    }

    /// Wrap an ADC channel with an explicit calibration.
    pub fn with_calibration(adc: A, calibration: GaugeCalibration) -> Self {
        Self { adc, calibration }
    }
}

#[async_trait]
impl<A: AnalogInput> PressureSensor for AnalogPressureSensor<A> {
    async fn read_pressure(&self) -> Result<f64> {
        let volts = self.adc.read_volts().await?;
        Ok(self.calibration.pressure_from_volts(volts))
    }
}

/// A [`FlowSensor`] built from a differential analog input, orifice geometry,
/// and a fixed air density.
pub struct OrificeFlowSensor<A: AnalogInput> {
    adc: A,
    calibration: DpCalibration,
    geometry: OrificeGeometry,
    air_density: f64,
}

impl<A: AnalogInput> OrificeFlowSensor<A> {
    /// Wrap a differential ADC channel with default calibration, geometry,
    /// and air density.
    pub fn new(adc: A) -> Self {
        Self {
            adc,
            calibration: DpCalibration::default(),
            geometry: OrificeGeometry::default(),
            air_density: DEFAULT_AIR_DENSITY,
        }
    }

    /// Override the assumed air density, e.g. from an ambient sensor via
    /// [`humid_air_density`].
    pub fn with_air_density(mut self, rho_kg_m3: f64) -> Self {
        self.air_density = rho_kg_m3;
        self
    }
}

#[async_trait]
impl<A: AnalogInput> FlowSensor for OrificeFlowSensor<A> {
    async fn read_flow(&self) -> Result<f64> {
        let volts = self.adc.read_volts().await?;
        let dp = self.calibration.dp_from_volts(volts);
        Ok(self.geometry.flow_lpm_from_dp(dp, self.air_density))
    }
}
