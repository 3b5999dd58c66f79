use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::{ffi::CString, os::raw::{c_char, c_int, c_void}, ptr};
use tracing::{debug, info};

use crate::{top1, Classification, Classifier, ClassifierConfig, Frame};

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;
}

/// Image classifier on the TensorFlow Lite C API. Expects a u8 RGB input of
/// `img_w x img_h` and a float32 `[1, num_classes]` output.
pub struct TfliteClassifier {
    img_w: u32,
    img_h: u32,
    class_names: Vec<String>,
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
}

// The interpreter is only touched through &mut self.
unsafe impl Send for TfliteClassifier {}

impl TfliteClassifier {
    pub fn new(cfg: &ClassifierConfig) -> Result<Self> {
        let model_path = cfg.model_path.as_deref().context("classifier.model_path missing")?;
        let class_names = cfg.class_names.clone().context("classifier.class_names missing")?;
        let img_w = cfg.img_w.unwrap_or(224);
        let img_h = cfg.img_h.unwrap_or(224);

        let cpath = CString::new(model_path)?;
        let model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        anyhow::ensure!(!model.is_null(), "failed to load tflite model: {}", model_path);

        let opts = unsafe { TfLiteInterpreterOptionsCreate() };
        anyhow::ensure!(!opts.is_null(), "failed to create tflite options");
        unsafe { TfLiteInterpreterOptionsSetNumThreads(opts, cfg.num_threads.unwrap_or(2)); }

        let interp = unsafe { TfLiteInterpreterCreate(model, opts) };
        anyhow::ensure!(!interp.is_null(), "failed to create tflite interpreter");

        let rc = unsafe { TfLiteInterpreterAllocateTensors(interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterAllocateTensors failed");

        info!("vision: loaded TFLite model: {} ({} classes)", model_path, class_names.len());
        Ok(Self { img_w, img_h, class_names, model, opts, interp })
    }

    fn run(&mut self, frame: &Frame) -> Result<Classification> {
        let img = frame.decode()?;
        let rgb = img.to_rgb8();
        let resized = image::imageops::resize(&rgb, self.img_w, self.img_h, FilterType::Triangle);

        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let in_ptr = unsafe { TfLiteTensorData(input) as *mut u8 };
        anyhow::ensure!(!in_ptr.is_null(), "null input tensor data");

        let need = (self.img_w * self.img_h * 3) as usize;
        anyhow::ensure!(in_bytes >= need, "input tensor too small: {} < {}", in_bytes, need);
        unsafe { ptr::copy_nonoverlapping(resized.as_raw().as_ptr(), in_ptr, need); }

        let rc = unsafe { TfLiteInterpreterInvoke(self.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterInvoke failed");

        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        anyhow::ensure!(!out.is_null(), "no output tensor 0");
        let out_ptr = unsafe { TfLiteTensorData(out) as *const f32 };
        anyhow::ensure!(!out_ptr.is_null(), "null output tensor data");
        let out_len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        let scores = unsafe { std::slice::from_raw_parts(out_ptr, out_len) };

        let c = top1(scores, &self.class_names).context("empty output tensor")?;
        debug!("tflite: frame {} -> {} ({:.2})", frame.seq, c.label, c.confidence);
        Ok(c)
    }
}

impl Classifier for TfliteClassifier {
    async fn classify(&mut self, frame: &Frame) -> Result<Classification> {
        self.run(frame)
    }
}

impl Drop for TfliteClassifier {
    fn drop(&mut self) {
        unsafe {
            if !self.interp.is_null() { TfLiteInterpreterDelete(self.interp); }
            if !self.opts.is_null() { TfLiteInterpreterOptionsDelete(self.opts); }
            if !self.model.is_null() { TfLiteModelDelete(self.model); }
        }
    }
}
