//! Fixed text blocks returned by the emulated command prompt.

use rand::seq::SliceRandom;

pub const WINDOWS_VERSION: &str = "10.0.17763.1";

const MOTD: [&str; 3] = [
    "WARNING: Unauthorized access to this system is prohibited.",
    "All activities are monitored and recorded.",
    "Violators will be prosecuted to the fullest extent of the law.",
];

/// Greeting written once after login
pub fn banner() -> String {
    let motd = MOTD.choose(&mut rand::thread_rng()).copied().unwrap_or(MOTD[0]);
    format!(
        "Microsoft Windows [Version {}]\r\n(c) 2018 Microsoft Corporation. All rights reserved.\r\n\r\n{}\r\n",
        WINDOWS_VERSION, motd
    )
}

pub fn ver() -> String {
    format!("Microsoft Windows [Version {}]", WINDOWS_VERSION)
}

pub fn ipconfig() -> String {
    [
        "Windows IP Configuration",
        "",
        "Ethernet adapter Ethernet:",
        "   Connection-specific DNS Suffix  . : localdomain",
        "   IPv4 Address. . . . . . . . . . . : 192.168.1.100",
        "   Subnet Mask . . . . . . . . . . . : 255.255.255.0",
        "   Default Gateway . . . . . . . . . : 192.168.1.1",
    ]
    .join("\n")
}

pub fn systeminfo(hostname: &str) -> String {
    format!(
        "Host Name:                 {host}\n\
         OS Name:                   Microsoft Windows Server 2019 Standard\n\
         OS Version:                10.0.17763 N/A Build 17763\n\
         OS Manufacturer:           Microsoft Corporation\n\
         OS Configuration:          Primary Domain Controller\n\
         OS Build Type:             Multiprocessor Free\n\
         Registered Owner:          Windows User\n\
         Registered Organization:   Contoso\n\
         Product ID:                00429-70000-00000-AA535\n\
         Original Install Date:     1/14/2025, 9:02:11 AM\n\
         System Boot Time:          6/12/2025, 8:00:03 AM\n\
         System Manufacturer:       Dell Inc.\n\
         System Model:              PowerEdge T40\n\
         System Type:               x64-based PC\n\
         Processor(s):              1 Processor(s) Installed.\n\
         \x20                          [01]: Intel64 Family 6 Model 85 Stepping 7 GenuineIntel ~2200 Mhz\n\
         BIOS Version:              Dell Inc. 1.0.0, 12/01/2024\n\
         Windows Directory:         C:\\Windows\n\
         System Directory:          C:\\Windows\\system32\n\
         Boot Device:               \\Device\\HarddiskVolume1\n\
         System Locale:             en-us;English (United States)\n\
         Time Zone:                 (UTC+01:00) Amsterdam, Berlin, Bern, Rome, Stockholm, Vienna\n\
         Total Physical Memory:     8,192 MB\n\
         Available Physical Memory: 6,000 MB\n\
         Virtual Memory: Max Size:  9,216 MB\n\
         Virtual Memory: Available: 7,000 MB\n\
         Virtual Memory: In Use:    2,216 MB\n\
         Page File Location(s):     C:\\pagefile.sys\n\
         Domain:                    CONTOSO\n\
         Logon Server:              \\\\{host}\n\
         Hotfix(s):                 5 Hotfix(s) Installed.\n\
         Network Card(s):           1 NIC(s) Installed.\n\
         \x20                          [01]: Intel(R) Ethernet Connection",
        host = hostname
    )
}

/// `powershell` only prints the banner; the session stays in cmd mode
pub fn powershell(working_dir: &str) -> String {
    format!(
        "Windows PowerShell\nCopyright (C) Microsoft Corporation. All rights reserved.\n\nPS {}>",
        working_dir
    )
}

/// Contents for `type`; `None` means the file is unknown
pub fn file_contents(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "passwords.docx" => Some("This file is binary and cannot be displayed."),
        "notes.txt" => Some(
            "- Rotate svc_backup password before the Q3 audit\n- Ask IT to renew the VPN certificate\n- DC01 patching window: Sunday 02:00",
        ),
        "readme.txt" => Some(
            "Contoso VPN client setup\nRun the installer as administrator and use your domain credentials.\nHelpdesk: ext. 4410",
        ),
        _ => None,
    }
}

/// The one file that always refuses to open
pub const PROTECTED_FILE: &str = "secret.txt";

pub fn user_details(name: &str) -> String {
    format!(
        "User name                    {name}\n\
         Full Name                    {full} User\n\
         Comment\n\
         Account active               Yes\n\
         Account expires              Never\n\
         \n\
         Password last set            1/1/2025 10:00 AM\n\
         Password expires             Never\n\
         Password changeable          1/1/2025 10:00 AM\n\
         Password required            Yes\n\
         User may change password     Yes\n\
         \n\
         The command completed successfully.",
        name = name,
        full = capitalize(name)
    )
}

pub fn user_list(hostname: &str, identities: &[String]) -> String {
    format!(
        "User accounts for \\\\{}\n\
         -------------------------------------------------------------------------------\n\
         {}\n\n\
         The command completed successfully.",
        hostname,
        identities.join("  ")
    )
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
