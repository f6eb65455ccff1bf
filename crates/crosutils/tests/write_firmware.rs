#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};

use crosutils::ErrorKind;
use crosutils::executor::{ChannelSink, ExecCtx, ToolPaths};
use crosutils::modules::firmware::{
    self, FdtChanges, FlashDest, ServoPort, WriteFirmwareOptions, WriteMethod,
};

const BOARD: &str = "tegra2_seaboard";
const TEXT_BASE: u32 = 0x00e0_8000;
const SIGNED: &[u8] = b"SIGNED-IMAGE";

struct Rig {
    tmp: tempfile::TempDir,
    log: PathBuf,
    tools: ToolPaths,
}

impl Rig {
    fn new(bct_type: &str) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let bin = root.join("bin");
        fs::create_dir_all(&bin).expect("mkdir bin");
        let log = root.join("calls.log");
        let log_cmd = format!("echo \"$(basename \"$0\") $*\" >> '{}'", log.display());

        let scripts: [(&str, String); 8] = [
            // -I dts -O dtb -o OUT SRC -i DIR
            ("dtc", format!("{log_cmd}\ncp \"$7\" \"$6\"")),
            // -t TYPE -d DEFAULT FILE NODE PROP
            (
                "fdtget",
                format!(
                    "case \"$6 $7\" in\n\
                     '/chromeos-config textbase') echo {} ;;\n\
                     '/aliases console') echo /serial@70006300 ;;\n\
                     *) echo \"$4\" ;;\n\
                     esac",
                    TEXT_BASE
                ),
            ),
            ("fdtput", log_cmd.clone()),
            ("bct_dump", format!("echo 'Boot device type: {bct_type}'")),
            (
                "cbootimage",
                format!(
                    "{log_cmd}\nprintf '{}' > \"$2\"",
                    String::from_utf8_lossy(SIGNED)
                ),
            ),
            ("nvflash", log_cmd.clone()),
            ("dut-control", log_cmd.clone()),
            ("flashrom", log_cmd.clone()),
        ];
        let mut tools = ToolPaths::default();
        for (name, body) in scripts {
            let path = bin.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write tool");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
            tools.set(name, path);
        }

        let fw = root.join("firmware");
        fs::create_dir_all(fw.join("bct")).expect("mkdir bct");
        fs::create_dir_all(fw.join("dts")).expect("mkdir dts");
        fs::write(fw.join("bct/board.bct"), b"bct").expect("write bct");
        fs::write(fw.join("dts/tegra2-seaboard.dts"), b"/dts-v1/; / { };").expect("write dts");
        fs::write(fw.join("u-boot.bin"), uboot_image()).expect("write u-boot");

        Self { tmp, log, tools }
    }

    fn firmware_dir(&self) -> PathBuf {
        self.tmp.path().join("firmware")
    }

    fn options(&self) -> WriteFirmwareOptions {
        WriteFirmwareOptions {
            board: BOARD.into(),
            firmware_dir: self.firmware_dir(),
            uboot: None,
            uboot_flasher: None,
            bct: None,
            fdt: None,
            postload: None,
            outdir: Some(self.tmp.path().join("out")),
            preserve: false,
            flash: FlashDest::Spi,
            write: None,
            servo: ServoPort::Any,
            verify: false,
            output: None,
            changes: FdtChanges::default(),
            servo_on: vec!["cold_reset:on".into(), "spi2_vref:pp3300".into()],
            servo_off: vec!["spi2_vref:off".into(), "cold_reset:off".into()],
        }
    }

    fn ctx(&self) -> ExecCtx {
        let (tx, _rx) = mpsc::channel();
        ExecCtx::new(false, Arc::new(ChannelSink::new(tx))).with_tools(self.tools.clone())
    }

    fn calls(&self, tool: &str) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.strip_prefix(tool).and_then(|r| r.strip_prefix(' ')))
            .map(ToOwned::to_owned)
            .collect()
    }
}

fn uboot_image() -> Vec<u8> {
    let mut data = vec![0u8; 512];
    data[0x20..0x24].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    data[0x24..0x28].copy_from_slice(&TEXT_BASE.to_le_bytes());
    data
}

fn read(p: &Path) -> Vec<u8> {
    fs::read(p).unwrap_or_else(|e| panic!("read {}: {e}", p.display()))
}

#[test]
fn bundles_signed_image_with_manifest() {
    let rig = Rig::new("NvBootDevType_Spi");
    let bundle = firmware::run(rig.options(), &mut rig.ctx()).expect("bundle");

    let out = rig.tmp.path().join("out");
    assert_eq!(bundle.text_base, TEXT_BASE);
    assert_eq!(bundle.fdt, out.join("tegra2-seaboard.dtb"));
    assert_eq!(read(&bundle.image), SIGNED);

    let mut stub = uboot_image();
    stub.extend_from_slice(&read(&bundle.fdt));
    assert_eq!(read(&bundle.bootstub), stub);

    let cfg = fs::read_to_string(out.join("boot.cfg")).expect("boot.cfg");
    assert!(cfg.contains(&format!("Bctfile    = {};", rig.firmware_dir().join("bct/board.bct").display())));
    assert!(cfg.contains(&format!("BootLoader = {},0xe08000,0xe08000,Complete;", bundle.bootstub.display())));
    assert!(!cfg.contains("Bctcopy"));

    let manifest: serde_json::Value =
        serde_json::from_slice(&read(&out.join("bundle.json"))).expect("manifest json");
    assert_eq!(manifest["board"], BOARD);
    assert_eq!(manifest["text_base"], "0xe08000");
    assert!(rig.calls("fdtput").is_empty(), "tree should not be modified");
}

#[test]
fn nand_bct_keeps_single_copy() {
    let rig = Rig::new("NvBootDevType_Nand");
    firmware::run(rig.options(), &mut rig.ctx()).expect("bundle");
    let cfg = fs::read_to_string(rig.tmp.path().join("out/boot.cfg")).expect("boot.cfg");
    assert!(cfg.contains("Bctcopy = 1;"), "{cfg}");
}

#[test]
fn fdt_changes_are_written_with_fdtput() {
    let rig = Rig::new("NvBootDevType_Spi");
    let mut opts = rig.options();
    opts.changes = FdtChanges {
        bootcmd: Some("none".into()),
        bootsecure: true,
        config_str: vec![("console".into(), "serial".into())],
        config_int: vec![("load-address".into(), "0x40000".into())],
        enable: vec![("console".into(), false), ("missing".into(), true)],
    };
    let bundle = firmware::run(opts, &mut rig.ctx()).expect("bundle");

    let fdt = bundle.fdt.display().to_string();
    let puts = rig.calls("fdtput");
    assert_eq!(
        puts,
        vec![
            format!("-p -t s {fdt} /config bootcmd "),
            format!("-p -t u {fdt} /config bootsecure 1"),
            format!("-p -t s {fdt} /config console serial"),
            format!("-p -t u {fdt} /config load-address 262144"),
            format!("-p -t s {fdt} /serial@70006300 status disabled"),
        ]
    );
}

#[test]
fn bad_config_int_is_an_input_error() {
    let rig = Rig::new("NvBootDevType_Spi");
    let mut opts = rig.options();
    opts.changes.config_int = vec![("bootdelay".into(), "soon".into())];
    let err = firmware::run(opts, &mut rig.ctx()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(err.to_string().contains("bootdelay=soon"), "{err}");
}

#[test]
fn missing_device_tree_tools_fail_first() {
    let rig = Rig::new("NvBootDevType_Spi");
    let mut tools = rig.tools.clone();
    tools.set("dtc", rig.tmp.path().join("bin/no-dtc"));
    let (tx, _rx) = mpsc::channel();
    let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx))).with_tools(tools);

    let err = firmware::run(rig.options(), &mut ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(err.to_string().contains("dtc"), "{err}");
    assert!(!rig.tmp.path().join("out").exists());
}

#[test]
fn postload_is_appended_after_resigning() {
    let rig = Rig::new("NvBootDevType_Spi");
    let postload = rig.tmp.path().join("u-boot-post.bin");
    fs::write(&postload, b"POSTLOAD").expect("write postload");
    let mut opts = rig.options();
    opts.postload = Some(postload);
    let bundle = firmware::run(opts, &mut rig.ctx()).expect("bundle");

    assert_eq!(read(&bundle.image), [SIGNED, b"POSTLOAD".as_slice()].concat());
    let puts = rig.calls("fdtput");
    assert!(puts[0].ends_with("/config postload-text-offset 4294967295"), "{puts:?}");
    assert!(
        puts[1].ends_with(&format!("/config postload-text-offset {}", SIGNED.len())),
        "{puts:?}"
    );
    assert_eq!(rig.calls("cbootimage").len(), 2);
}

#[test]
fn usb_write_loads_flasher_with_payload() {
    let rig = Rig::new("NvBootDevType_Spi");
    let mut opts = rig.options();
    opts.write = Some(WriteMethod::Usb);
    opts.verify = true;
    let bundle = firmware::run(opts, &mut rig.ctx()).expect("usb write");

    let out = rig.tmp.path().join("out");
    let flasher = out.join("flasher.bin");
    let bct = rig.firmware_dir().join("bct/board.bct");
    assert_eq!(
        rig.calls("nvflash"),
        vec![format!(
            "--bct {} --setbct --bl {} --go",
            bct.display(),
            flasher.display()
        )]
    );

    let fdt_len = read(&out.join("flasher.dtb")).len();
    let offset = (uboot_image().len() + fdt_len).div_ceil(0x1000) * 0x1000;
    let data = read(&flasher);
    assert_eq!(data.len(), offset + SIGNED.len());
    assert_eq!(&data[offset..], read(&bundle.image).as_slice());

    let bootcmd = rig
        .calls("fdtput")
        .into_iter()
        .filter(|c| c.contains("/config bootcmd "))
        .last()
        .expect("bootcmd put");
    let addr = TEXT_BASE as usize + offset;
    assert!(bootcmd.contains(&format!("sf write {addr:#010x} 0 ")), "{bootcmd}");
    assert!(bootcmd.contains("cmp.b"), "{bootcmd}");
}

#[test]
fn servo_write_restores_dut_controls() {
    let rig = Rig::new("NvBootDevType_Spi");
    let mut opts = rig.options();
    opts.write = Some(WriteMethod::Servo);
    opts.servo = ServoPort::Port(9999);
    opts.verify = true;
    let bundle = firmware::run(opts, &mut rig.ctx()).expect("servo write");

    assert_eq!(
        rig.calls("dut-control"),
        vec![
            "--port 9999 cold_reset:on spi2_vref:pp3300".to_string(),
            "--port 9999 spi2_vref:off cold_reset:off".to_string(),
        ]
    );
    let image = bundle.image.display();
    assert_eq!(
        rig.calls("flashrom"),
        vec![
            format!("-p ft2232_spi:type=servo-v2,port=9999 -w {image}"),
            format!("-p ft2232_spi:type=servo-v2,port=9999 -v {image}"),
        ]
    );
}

#[test]
fn servo_write_needs_a_servo_and_spi() {
    let rig = Rig::new("NvBootDevType_Spi");
    let mut opts = rig.options();
    opts.write = Some(WriteMethod::Servo);
    opts.servo = ServoPort::None;
    let err = firmware::run(opts, &mut rig.ctx()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    let mut opts = rig.options();
    opts.write = Some(WriteMethod::Servo);
    opts.flash = FlashDest::Mmc;
    let err = firmware::run(opts, &mut rig.ctx()).unwrap_err();
    assert!(err.to_string().contains("mmc"), "{err}");
    assert!(rig.calls("flashrom").is_empty());
}

#[test]
fn temp_outdir_is_removed_unless_preserved() {
    let rig = Rig::new("NvBootDevType_Spi");
    let output = rig.tmp.path().join("image-copy.bin");
    let mut opts = rig.options();
    opts.outdir = None;
    opts.output = Some(output.clone());
    let bundle = firmware::run(opts, &mut rig.ctx()).expect("bundle");
    assert!(!bundle.image.exists());
    assert_eq!(read(&output), SIGNED);

    let mut opts = rig.options();
    opts.outdir = None;
    opts.preserve = true;
    let bundle = firmware::run(opts, &mut rig.ctx()).expect("bundle");
    assert!(bundle.image.exists());
    let kept = bundle.image.parent().expect("outdir").to_path_buf();
    fs::remove_dir_all(kept).expect("cleanup");
}
