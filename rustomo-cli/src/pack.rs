/*!
The `pack` command: write a synthetic raw acquisition container, with
flats up front and darks at the end the way beamline files arrive.
*/

use crate::synthetic::ramp_volume;

use anyhow::Result;
use ndarray::{Array3, Axis, Slice};
use rustomo::loader::flatfile::RawFlatFileWriter;

use std::path::PathBuf;

pub fn pack(
    output: PathBuf,
    angles: usize,
    flats: usize,
    darks: usize,
    detector_y: usize,
    detector_x: usize,
) -> Result<()> {
    let total = flats + angles + darks;
    let mut volume: Array3<f32> = ramp_volume(total, detector_y, detector_x);
    // flats bright, darks near zero
    volume
        .slice_axis_mut(Axis(0), Slice::from(0..flats))
        .mapv_inplace(|v| v + 1000.0);
    volume
        .slice_axis_mut(Axis(0), Slice::from(total - darks..total))
        .mapv_inplace(|v| v * 0.01);

    let mut key = vec![0_i32; total];
    for entry in key.iter_mut().take(flats) {
        *entry = 1;
    }
    for entry in key.iter_mut().skip(total - darks) {
        *entry = 2;
    }
    let step = 180.0 / angles.max(1) as f32;
    let angle_values: Vec<f32> = (0..total).map(|i| i.saturating_sub(flats) as f32 * step).collect();

    let mut writer = RawFlatFileWriter::create(&output)?;
    writer.add_volume("entry/data", volume.view())?;
    writer.add_image_key("entry/image_key", &key)?;
    writer.add_angles("entry/angles", &angle_values)?;
    writer.finish()?;

    println!(
        "wrote {} ({} flats + {} projections + {} darks, detector {}x{})",
        output.display(),
        flats,
        angles,
        darks,
        detector_y,
        detector_x
    );
    Ok(())
}
