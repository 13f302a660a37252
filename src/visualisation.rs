// src/visualisation.rs
//
// Hysteresis loop plot (m against h) as a PNG.
//
// Measured points are drawn as blue markers, the model loop as a red line. Plots carry no
// text so that no font backend is needed; the axes through the origin are drawn in grey.

use plotters::prelude::*;

/// Padded (min, max) of the finite values, never empty.
fn padded_range<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in values {
        if v.is_finite() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }

    // Handle pathological case (no finite data, or a flat line)
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    if (hi - lo).abs() < 1e-30 {
        let delta = if hi.abs() < 1e-30 { 1.0 } else { 0.1 * hi.abs() };
        return (lo - delta, hi + delta);
    }
    let margin = 0.05 * (hi - lo);
    (lo - margin, hi + margin)
}

/// Save the model loop (and optionally the measured loop) to `filename`.
pub fn save_loop_plot(
    h: &[f64],
    m_measured: Option<&[f64]>,
    m_model: &[f64],
    filename: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if h.is_empty() {
        return Ok(()); // nothing to plot
    }

    let (x_min, x_max) = padded_range(h.iter());
    let (y_min, y_max) = padded_range(m_model.iter().chain(m_measured.unwrap_or(&[]).iter()));

    let root = BitMapBackend::new(filename, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(30)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)?;

    let grey = RGBColor(160, 160, 160);
    if x_min < 0.0 && x_max > 0.0 {
        chart.draw_series(LineSeries::new(vec![(0.0, y_min), (0.0, y_max)], &grey))?;
    }
    if y_min < 0.0 && y_max > 0.0 {
        chart.draw_series(LineSeries::new(vec![(x_min, 0.0), (x_max, 0.0)], &grey))?;
    }
    chart.draw_series(std::iter::once(Rectangle::new(
        [(x_min, y_min), (x_max, y_max)],
        BLACK.stroke_width(1),
    )))?;

    if let Some(m) = m_measured {
        chart.draw_series(
            h.iter()
                .zip(m)
                .map(|(&x, &y)| Circle::new((x, y), 3, BLUE.filled())),
        )?;
    }

    chart.draw_series(LineSeries::new(
        h.iter().zip(m_model).map(|(&x, &y)| (x, y)),
        RED.stroke_width(2),
    ))?;

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_padded_and_never_empty() {
        let (lo, hi) = padded_range([0.0, 1.0].iter());
        assert!(lo < 0.0 && hi > 1.0);
        assert_eq!(padded_range([f64::NAN].iter()), (-1.0, 1.0));
        let (lo, hi) = padded_range([2.0, 2.0].iter());
        assert!(lo < 2.0 && hi > 2.0);
    }

    #[test]
    fn writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.png");
        let h = vec![-1.0, 0.0, 1.0, 0.0, -1.0];
        let m = vec![-1.0, -0.5, 1.0, 0.5, -1.0];
        save_loop_plot(&h, Some(m.as_slice()), &m, path.to_str().unwrap()).unwrap();
        assert!(path.exists());
    }
}
