//! HLX convolution planner
//!
//! Prints the tiling, packed buffer sizes and dispatch geometry the
//! configurator picks for one convolution on one device, as JSON.
//!
//! Usage:
//!   hlx_conv_plan --out 32 --in 16 --kernel 3x3 --input 56x56 --vendor nvidia
//!   hlx_conv_plan --fully-connected --out 1000 --in 2048 --batch 4 --profile gpu.json
//!   hlx_conv_plan --vendor mali --dump-profile

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use hlx_conv::{
    Bhwc, CalculationsPrecision, Conv2dAttributes, ConvError, ConvOperation, DeviceCapability,
    FullyConnectedAttributes, GpuVendor, Hw, Ohwi, OperationDef, Padding, ProblemShape,
};
use hlx_conv::host::HostContext;

#[derive(Parser, Debug)]
#[command(name = "hlx_conv_plan", version, about = "Plan a GPU convolution and print it as JSON")]
struct Args {
    /// Output channels
    #[arg(long = "out", default_value_t = 32)]
    output_channels: u32,

    /// Input channels
    #[arg(long = "in", default_value_t = 32)]
    input_channels: u32,

    /// Kernel size, HxW
    #[arg(long, default_value = "1x1", value_parser = parse_hw)]
    kernel: Hw,

    #[arg(long, default_value = "1x1", value_parser = parse_hw)]
    stride: Hw,

    #[arg(long, default_value = "1x1", value_parser = parse_hw)]
    dilation: Hw,

    /// Symmetric padding, HxW
    #[arg(long, default_value = "0x0", value_parser = parse_hw)]
    padding: Hw,

    /// Input spatial size, HxW. Enables the dispatch section of the plan.
    #[arg(long, value_parser = parse_hw)]
    input: Option<Hw>,

    #[arg(long, default_value_t = 1)]
    batch: u32,

    /// Plan a fully-connected layer (kernel, stride and padding are ignored)
    #[arg(long)]
    fully_connected: bool,

    /// Vendor preset: nvidia, powervr, adreno, mali, amd, intel, apple, unknown
    #[arg(long, default_value = "unknown")]
    vendor: GpuVendor,

    /// JSON device profile; overrides --vendor
    #[arg(long)]
    profile: Option<PathBuf>,

    /// f32, f32f16 or f16
    #[arg(long, default_value = "f32")]
    precision: CalculationsPrecision,

    #[arg(long)]
    batch_support: bool,

    /// Print the device profile instead of a plan
    #[arg(long)]
    dump_profile: bool,

    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hw(s: &str) -> Result<Hw, String> {
    let (h, w) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected HxW, got '{}'", s))?;
    let h = h.trim().parse::<u32>().map_err(|e| format!("bad height '{}': {}", h, e))?;
    let w = w.trim().parse::<u32>().map_err(|e| format!("bad width '{}': {}", w, e))?;
    Ok(Hw::new(h, w))
}

fn run(args: &Args) -> Result<String, ConvError> {
    let capability = match &args.profile {
        Some(path) => DeviceCapability::load(path)?,
        None => DeviceCapability::preset(args.vendor),
    };
    if args.dump_profile {
        return capability.to_json();
    }

    let mut def = OperationDef::new(args.precision);
    def.batch_support = args.batch_support || args.batch > 1;

    let (op, output): (ConvOperation<HostContext>, Option<Bhwc>) = if args.fully_connected {
        let attr = FullyConnectedAttributes::new(args.output_channels, args.input_channels);
        let op = ConvOperation::fully_connected(def, &attr, &capability)?;
        let output = Bhwc::new(args.batch, 1, 1, args.output_channels);
        (op, Some(output))
    } else {
        let attr = Conv2dAttributes {
            weights: Ohwi::new(
                args.output_channels,
                args.kernel.h,
                args.kernel.w,
                args.input_channels,
            ),
            strides: args.stride,
            dilations: args.dilation,
            padding: Padding::symmetric(args.padding.h, args.padding.w),
        };
        let mut shape = ProblemShape::from_conv2d(&attr);
        let output = match args.input {
            Some(input) => {
                let out = shape.output_size(input)?;
                shape = shape.with_output_hint(out);
                Some(Bhwc::new(args.batch, out.h, out.w, args.output_channels))
            }
            None => None,
        };
        let mut op = ConvOperation::new(def);
        op.configure(shape, &capability)?;
        (op, output)
    };

    let plan = op.plan(output.as_ref())?;
    Ok(serde_json::to_string_pretty(&plan)?)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(&args) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
