fn main() {
  cfg_aliases::cfg_aliases! {
      linux: { target_os = "linux" },
      windows: { target_os = "windows" },
  }
}
