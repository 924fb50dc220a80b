#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

fn main() {
    chemsim_desktop_lib::run()
}
