// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;

use canonical_error::{failed_precondition_error, CanonicalError};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use log::{debug, warn};

/// Header metadata written to every FITS image, over and above the keywords
/// required to store the array itself. Mostly sensor constants; the capture
/// fields (times, focus, aperture, exposure, gain) are refreshed per frame.
#[derive(Clone, Debug)]
pub struct FitsMetadata {
    // Capture data.
    pub origin: String,
    pub instrume: String,
    pub telescop: String,
    pub observat: String,
    pub observer: String,
    pub filename: String,
    pub date: String,
    pub utcsec: u64,
    pub utcusec: u64,
    pub filter: String,
    pub ccdtemp: f32,
    pub focus: i16,
    pub aperture: i16,
    pub exptime: f32,
    pub bunit: String,

    // Compression settings.
    pub fzalgor: String,
    pub fztile: String,

    // Sensor settings.
    pub detector: String,
    pub sensorid: u64,
    pub bitdepth: u8,
    pub pixscal1: f32,
    pub pixscal2: f32,
    pub pixsize1: f32,
    pub pixsize2: f32,
    pub darkcur: f32,
    pub rdnoise1: f32,
    pub ccdbin1: u8,
    pub ccdbin2: u8,
    pub pixelclk: f32,
    pub framerte: f32,
    pub gainfact: f32,
    pub trigdlay: f32,
    pub bloffset: u16,
    pub autogain: bool,
    pub autoexp: bool,
    pub autoblk: bool,
}

impl Default for FitsMetadata {
    fn default() -> Self {
        FitsMetadata {
            origin: "starcam-server".to_string(),
            instrume: "starcam".to_string(),
            telescop: "Sigma 85mm f/1.4 DG HSM ART".to_string(),
            observat: "balloon".to_string(),
            observer: "starcam".to_string(),
            filename: String::new(),
            date: "1970-01-01T00:00:00".to_string(),
            utcsec: 0,
            utcusec: 0,
            filter: "B+W 091 (630nm)".to_string(),
            ccdtemp: 0.0,
            focus: 0,
            aperture: 14,
            exptime: 0.1,
            bunit: "ADU".to_string(),
            fzalgor: "RICE_1".to_string(),
            fztile: "ROW".to_string(),
            detector: "iDS U3-31N0CP-M-GL Rev. 2.2".to_string(),
            sensorid: 0,
            bitdepth: 12,
            pixscal1: 6.63,
            pixscal2: 6.63,
            pixsize1: 2.74,
            pixsize2: 2.74,
            darkcur: 1.38,
            rdnoise1: 2.37,
            ccdbin1: 1,
            ccdbin2: 1,
            pixelclk: 99.0,
            framerte: 1.0,
            gainfact: 1.0,
            trigdlay: 0.0,
            bloffset: 50,
            autogain: false,
            autoexp: false,
            autoblk: false,
        }
    }
}

fn fits_err(what: &str, e: fitsio::errors::Error) -> CanonicalError {
    failed_precondition_error(format!("{}: {:?}", what, e).as_str())
}

fn put_str(fptr: &mut FitsFile, hdu: &fitsio::hdu::FitsHdu, key: &str,
           value: &str) -> Result<(), CanonicalError> {
    hdu.write_key(fptr, key, value).map_err(|e| fits_err(key, e))
}

fn put_int(fptr: &mut FitsFile, hdu: &fitsio::hdu::FitsHdu, key: &str,
           value: i64) -> Result<(), CanonicalError> {
    hdu.write_key(fptr, key, value).map_err(|e| fits_err(key, e))
}

fn put_f64(fptr: &mut FitsFile, hdu: &fitsio::hdu::FitsHdu, key: &str,
           value: f64) -> Result<(), CanonicalError> {
    hdu.write_key(fptr, key, value).map_err(|e| fits_err(key, e))
}

fn write_metadata(fptr: &mut FitsFile, hdu: &fitsio::hdu::FitsHdu,
                  metadata: &FitsMetadata) -> Result<(), CanonicalError> {
    put_str(fptr, hdu, "ORIGIN", &metadata.origin)?;
    put_str(fptr, hdu, "INSTRUME", &metadata.instrume)?;
    put_str(fptr, hdu, "TELESCOP", &metadata.telescop)?;
    put_str(fptr, hdu, "OBSERVAT", &metadata.observat)?;
    put_str(fptr, hdu, "OBSERVER", &metadata.observer)?;
    put_str(fptr, hdu, "FILENAME", &metadata.filename)?;
    put_str(fptr, hdu, "DATE", &metadata.date)?;
    put_int(fptr, hdu, "UTC-SEC", metadata.utcsec as i64)?;
    put_int(fptr, hdu, "UTC-USEC", metadata.utcusec as i64)?;
    put_str(fptr, hdu, "FILTER", &metadata.filter)?;
    put_f64(fptr, hdu, "CCDTEMP", metadata.ccdtemp as f64)?;
    put_int(fptr, hdu, "FOCUS", metadata.focus as i64)?;
    put_int(fptr, hdu, "APERTURE", metadata.aperture as i64)?;
    put_f64(fptr, hdu, "EXPTIME", metadata.exptime as f64)?;
    put_str(fptr, hdu, "BUNIT", &metadata.bunit)?;
    put_str(fptr, hdu, "FZALGOR", &metadata.fzalgor)?;
    put_str(fptr, hdu, "FZTILE", &metadata.fztile)?;
    put_str(fptr, hdu, "DETECTOR", &metadata.detector)?;
    put_int(fptr, hdu, "SENSORID", metadata.sensorid as i64)?;
    put_int(fptr, hdu, "BITDEPTH", metadata.bitdepth as i64)?;
    put_f64(fptr, hdu, "PIXSCAL1", metadata.pixscal1 as f64)?;
    put_f64(fptr, hdu, "PIXSCAL2", metadata.pixscal2 as f64)?;
    put_f64(fptr, hdu, "PIXSIZE1", metadata.pixsize1 as f64)?;
    put_f64(fptr, hdu, "PIXSIZE2", metadata.pixsize2 as f64)?;
    put_f64(fptr, hdu, "DARKCUR", metadata.darkcur as f64)?;
    put_f64(fptr, hdu, "RDNOISE1", metadata.rdnoise1 as f64)?;
    put_int(fptr, hdu, "CCDBIN1", metadata.ccdbin1 as i64)?;
    put_int(fptr, hdu, "CCDBIN2", metadata.ccdbin2 as i64)?;
    put_f64(fptr, hdu, "PIXELCLK", metadata.pixelclk as f64)?;
    put_f64(fptr, hdu, "FRAMERTE", metadata.framerte as f64)?;
    put_f64(fptr, hdu, "GAINFACT", metadata.gainfact as f64)?;
    put_f64(fptr, hdu, "TRIGDLAY", metadata.trigdlay as f64)?;
    put_int(fptr, hdu, "BLOFFSET", metadata.bloffset as i64)?;
    put_int(fptr, hdu, "AUTOGAIN", metadata.autogain as i64)?;
    put_int(fptr, hdu, "AUTOEXP", metadata.autoexp as i64)?;
    put_int(fptr, hdu, "AUTOBLK", metadata.autoblk as i64)?;
    Ok(())
}

fn create_image_file(path_spec: &str, image: &[u16], width: usize,
                     height: usize, metadata: &FitsMetadata)
                     -> Result<FitsFile, CanonicalError> {
    // NAXIS1 is the fast axis (columns); the crate takes dimensions
    // slow-axis first.
    let description = ImageDescription {
        data_type: ImageType::UnsignedShort,
        dimensions: &[height, width],
    };
    let mut fptr = FitsFile::create(path_spec)
        .with_custom_primary(&description)
        .open()
        .map_err(|e| fits_err(path_spec, e))?;
    let hdu = fptr.primary_hdu().map_err(|e| fits_err(path_spec, e))?;
    write_metadata(&mut fptr, &hdu, metadata)?;
    hdu.write_image(&mut fptr, image)
        .map_err(|e| fits_err("write_image", e))?;
    Ok(fptr)
}

/// Writes the unpacked frame as an uncompressed temporary file, then as the
/// final RICE_1 row-tile-compressed file with a checksum, and removes the
/// temporary. The unsigned 16-bit samples land as BITPIX=16 with
/// BZERO=32768/BSCALE=1.0 per the FITS unsigned convention.
pub fn write_image(final_path: &Path, image: &[u16], width: usize,
                   height: usize, metadata: &FitsMetadata)
                   -> Result<(), CanonicalError> {
    let tmp_path = final_path.with_extension("tmp.fits");
    // Delete leftovers from an unclean shutdown.
    let _ = std::fs::remove_file(&tmp_path);
    let _ = std::fs::remove_file(final_path);

    let tmp = create_image_file(
        &tmp_path.to_string_lossy(), image, width, height, metadata)?;
    drop(tmp);

    // cfitsio's extended filename syntax requests tile compression on the
    // output; one row per tile.
    let compress_spec = format!("{}[compress R {},1]",
                                final_path.to_string_lossy(), width);
    let mut comp = create_image_file(
        &compress_spec, image, width, height, metadata)?;

    // The fitsio crate does not wrap fits_write_chksum; use the underlying
    // library handle.
    let mut status = 0;
    unsafe {
        fitsio_sys::ffpcks(comp.as_raw(), &mut status);
    }
    if status != 0 {
        warn!("Error {} writing checksum for {:?}", status, final_path);
    }
    drop(comp);

    if let Err(e) = std::fs::remove_file(&tmp_path) {
        warn!("Error removing {:?}: {:?}", tmp_path, e);
    }
    debug!("Wrote FITS image {:?}", final_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use super::*;

    fn gradient_image(width: usize, height: usize) -> Vec<u16> {
        (0..width * height).map(|i| (i % 4096) as u16).collect()
    }

    #[test]
    fn test_uncompressed_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let (width, height) = (64_usize, 32);
        let image = gradient_image(width, height);

        let fptr = create_image_file(&path.to_string_lossy(), &image, width,
                                     height, &FitsMetadata::default()).unwrap();
        drop(fptr);

        let mut fptr = FitsFile::open(&path).unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        let read_back: Vec<u16> = hdu.read_image(&mut fptr).unwrap();
        assert_eq!(read_back, image);

        let origin: String = hdu.read_key(&mut fptr, "ORIGIN").unwrap();
        assert_eq!(origin, "starcam-server");
        let bitdepth: i64 = hdu.read_key(&mut fptr, "BITDEPTH").unwrap();
        assert_eq!(bitdepth, 12);
    }

    #[test]
    fn test_compressed_write_removes_temporary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let (width, height) = (64_usize, 32);
        let image = gradient_image(width, height);

        let mut metadata = FitsMetadata::default();
        metadata.filename = "frame.fits".to_string();
        metadata.utcsec = 1_700_000_000;
        write_image(&path, &image, width, height, &metadata).unwrap();

        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        assert!(!path.with_extension("tmp.fits").exists());
    }
}  // mod tests.
